use candle_core::{Result, Tensor};

/// Recurrent state-update function driving the step loop.
pub trait TransitionModuleT {
    /// Advance the hidden state.
    ///
    /// # Arguments
    /// * `input_nf` - step input features (n x f)
    /// * `hidden_nh` - previous hidden state (n x h)
    ///
    /// # Returns `(output_nh, hidden_nh)`
    /// * `output_nh` - step output fed to the parameter heads (n x h)
    /// * `hidden_nh` - next hidden state (n x h)
    fn forward(&self, input_nf: &Tensor, hidden_nh: &Tensor) -> Result<(Tensor, Tensor)>;

    fn dim_hidden(&self) -> usize;
}

/// Maps a flat image or glimpse tensor to a feature vector.
pub trait FeatureEncoderT {
    fn forward(&self, x_nf: &Tensor) -> Result<Tensor>;

    fn dim_input(&self) -> usize;

    fn dim_output(&self) -> usize;
}

/// Renders an appearance code into a flattened glimpse.
pub trait GlimpseDecoderT {
    /// * `what_nk` - appearance codes (n x k)
    ///
    /// Returns glimpse pixels (n x glimpse_h * glimpse_w).
    fn forward(&self, what_nk: &Tensor) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;

    fn dim_glimpse(&self) -> usize;
}

/// Produces pose distribution parameters from transition output.
///
/// The pose vector has four components in fixed order:
/// scale-x, shift-x, scale-y, shift-y.
pub trait TransformEstimatorT {
    /// Returns `(loc_n4, scale_n4)`; scales must be positive.
    fn forward(&self, hidden_nh: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Predicts the probability of taking one more inference step.
pub trait StepsPredictorT {
    /// Returns continuation probability (n x 1), values in [0, 1].
    fn forward(&self, hidden_nh: &Tensor) -> Result<Tensor>;
}

/// Control-variate predictor for the score-function estimator.
pub trait BaselineModuleT {
    /// Predict the per-sample importance weight.
    ///
    /// # Arguments
    /// * `obs_nf` - flattened observation (n x img_h * img_w)
    /// * `what_nsk` - appearance samples, batch-major (n x steps x k)
    /// * `where_ns4` - pose samples, batch-major (n x steps x 4)
    /// * `presence_ns1` - presence indicators, batch-major (n x steps x 1)
    /// * `hidden_nh` - final recurrent state (n x h)
    ///
    /// Returns predictions (n x 1).
    fn forward(
        &self,
        obs_nf: &Tensor,
        what_nsk: &Tensor,
        where_ns4: &Tensor,
        presence_ns1: &Tensor,
        hidden_nh: &Tensor,
    ) -> Result<Tensor>;
}

/// Crops a glimpse out of an image at a pose, and inversely places a rendered
/// glimpse back onto a full-size canvas. `render` is the inverse of `extract`
/// under the same pose.
pub trait SpatialTransformerT {
    /// * `img_nhw` - images (n x img_h x img_w)
    /// * `where_n4` - pose vectors (n x 4)
    ///
    /// Returns glimpses (n x glimpse_h x glimpse_w).
    fn extract(&self, img_nhw: &Tensor, where_n4: &Tensor) -> Result<Tensor>;

    /// * `glimpse_nhw` - rendered glimpses (n x glimpse_h x glimpse_w)
    /// * `where_n4` - pose vectors (n x 4)
    ///
    /// Returns canvas-sized images (n x img_h x img_w), zero outside the
    /// placed window.
    fn render(&self, glimpse_nhw: &Tensor, where_n4: &Tensor) -> Result<Tensor>;
}
