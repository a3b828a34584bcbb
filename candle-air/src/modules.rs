//! Default implementations of the pluggable module contracts.
//!
//! These are deliberately small MLP-based modules: enough to train the model
//! end to end and to exercise every contract in tests. Any of them can be
//! replaced by a custom implementation of the corresponding trait.

use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, VarBuilder};

use crate::model_traits::{
    BaselineModuleT, FeatureEncoderT, GlimpseDecoderT, StepsPredictorT, TransformEstimatorT,
    TransitionModuleT,
};

/// Numerically stable softplus: ln(1 + e^x) = max(x, 0) + ln(1 + e^-|x|).
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear_part = x.relu()?;
    let log_part = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    linear_part + log_part
}

/// Reparameterized Gaussian sample: loc + scale * eps with eps ~ N(0, 1).
/// Falls back to the mean when not training.
pub fn sample_normal(loc: &Tensor, scale: &Tensor, train: bool) -> Result<Tensor> {
    if train {
        let eps = loc.randn_like(0., 1.)?;
        (scale * eps)? + loc
    } else {
        Ok(loc.clone())
    }
}

/// Fully-connected ReLU stack.
pub struct Mlp {
    fc: Vec<Linear>,
    dim_in: usize,
    dim_out: usize,
}

impl Mlp {
    /// Builds layers `fc.0`, `fc.1`, ... each followed by ReLU.
    pub fn new(dim_in: usize, dims: &[usize], vb: VarBuilder) -> Result<Self> {
        debug_assert!(!dims.is_empty());
        let mut fc = Vec::with_capacity(dims.len());
        let mut prev_dim = dim_in;
        for (j, &next_dim) in dims.iter().enumerate() {
            fc.push(candle_nn::linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?);
            prev_dim = next_dim;
        }
        Ok(Self {
            fc,
            dim_in,
            dim_out: prev_dim,
        })
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }
}

impl Module for Mlp {
    fn forward(&self, x_nf: &Tensor) -> Result<Tensor> {
        let mut h = x_nf.clone();
        for layer in &self.fc {
            h = layer.forward(&h)?.relu()?;
        }
        Ok(h)
    }
}

/// MLP feature encoder for flat images and glimpses.
pub struct Encoder {
    net: Mlp,
}

impl Encoder {
    pub fn new(dim_in: usize, dims: &[usize], vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            net: Mlp::new(dim_in, dims, vb)?,
        })
    }
}

impl FeatureEncoderT for Encoder {
    fn forward(&self, x_nf: &Tensor) -> Result<Tensor> {
        self.net.forward(x_nf)
    }

    fn dim_input(&self) -> usize {
        self.net.dim_in()
    }

    fn dim_output(&self) -> usize {
        self.net.dim_out()
    }
}

/// Gated recurrent unit built from linear layers.
///
/// Kept as a plain cell (single step) so the unrolling loop owns the state,
/// rather than handing control to a sequence runner.
pub struct GruCell {
    update: Linear,
    reset: Linear,
    candidate: Linear,
    dim_hidden: usize,
}

impl GruCell {
    pub fn new(dim_in: usize, dim_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let update = candle_nn::linear(dim_in + dim_hidden, dim_hidden, vb.pp("update"))?;
        let reset = candle_nn::linear(dim_in + dim_hidden, dim_hidden, vb.pp("reset"))?;
        let candidate = candle_nn::linear(dim_in + dim_hidden, dim_hidden, vb.pp("candidate"))?;
        Ok(Self {
            update,
            reset,
            candidate,
            dim_hidden,
        })
    }
}

impl TransitionModuleT for GruCell {
    fn forward(&self, input_nf: &Tensor, hidden_nh: &Tensor) -> Result<(Tensor, Tensor)> {
        let xh = Tensor::cat(&[input_nf, hidden_nh], 1)?;
        let z_nh = ops::sigmoid(&self.update.forward(&xh)?)?;
        let r_nh = ops::sigmoid(&self.reset.forward(&xh)?)?;

        let gated = (r_nh * hidden_nh)?;
        let xrh = Tensor::cat(&[input_nf, &gated], 1)?;
        let cand_nh = self.candidate.forward(&xrh)?.tanh()?;

        let keep_nh = z_nh.affine(-1., 1.)?;
        let hidden_nh = ((z_nh * cand_nh)? + (keep_nh * hidden_nh)?)?;
        Ok((hidden_nh.clone(), hidden_nh))
    }

    fn dim_hidden(&self) -> usize {
        self.dim_hidden
    }
}

/// Linear heads mapping features to Normal parameters (loc, softplus scale).
pub struct ParametrisedGaussian {
    loc: Linear,
    scale_raw: Linear,
    scale_offset: f64,
}

impl ParametrisedGaussian {
    pub fn new(dim_in: usize, dim_out: usize, scale_offset: f64, vb: VarBuilder) -> Result<Self> {
        let loc = candle_nn::linear(dim_in, dim_out, vb.pp("loc"))?;
        let scale_raw = candle_nn::linear(dim_in, dim_out, vb.pp("scale"))?;
        Ok(Self {
            loc,
            scale_raw,
            scale_offset,
        })
    }

    /// Returns `(loc, scale)`; the scale floor keeps downstream KL terms
    /// finite when the raw head saturates negative.
    pub fn params(&self, feat_nf: &Tensor) -> Result<(Tensor, Tensor)> {
        let loc = self.loc.forward(feat_nf)?;
        let raw = (self.scale_raw.forward(feat_nf)? + self.scale_offset)?;
        let scale = (softplus(&raw)? + 1e-4)?;
        Ok((loc, scale))
    }
}

/// Pose parameter head: features -> Normal(loc, scale) over the 4-component
/// pose vector.
pub struct TransformParamNet {
    net: Mlp,
    head: ParametrisedGaussian,
}

impl TransformParamNet {
    pub fn new(dim_in: usize, dims: &[usize], scale_offset: f64, vb: VarBuilder) -> Result<Self> {
        let net = Mlp::new(dim_in, dims, vb.pp("net"))?;
        let head = ParametrisedGaussian::new(net.dim_out(), 4, scale_offset, vb.pp("head"))?;
        Ok(Self { net, head })
    }
}

impl TransformEstimatorT for TransformParamNet {
    fn forward(&self, hidden_nh: &Tensor) -> Result<(Tensor, Tensor)> {
        self.head.params(&self.net.forward(hidden_nh)?)
    }
}

/// Continuation-probability head: features -> sigmoid logit.
pub struct StepsPredictorNet {
    net: Mlp,
    logit: Linear,
}

impl StepsPredictorNet {
    pub fn new(dim_in: usize, dims: &[usize], vb: VarBuilder) -> Result<Self> {
        let net = Mlp::new(dim_in, dims, vb.pp("net"))?;
        let logit = candle_nn::linear(net.dim_out(), 1, vb.pp("logit"))?;
        Ok(Self { net, logit })
    }
}

impl StepsPredictorT for StepsPredictorNet {
    fn forward(&self, hidden_nh: &Tensor) -> Result<Tensor> {
        ops::sigmoid(&self.logit.forward(&self.net.forward(hidden_nh)?)?)
    }
}

/// Appearance decoder: latent code -> flattened glimpse pixels.
pub struct GlimpseDecoderNet {
    net: Mlp,
    out: Linear,
    dim_latent: usize,
    dim_glimpse: usize,
}

impl GlimpseDecoderNet {
    pub fn new(
        dim_latent: usize,
        dims: &[usize],
        glimpse_size: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let net = Mlp::new(dim_latent, dims, vb.pp("net"))?;
        let dim_glimpse = glimpse_size.0 * glimpse_size.1;
        let out = candle_nn::linear(net.dim_out(), dim_glimpse, vb.pp("out"))?;
        Ok(Self {
            net,
            out,
            dim_latent,
            dim_glimpse,
        })
    }
}

impl GlimpseDecoderT for GlimpseDecoderNet {
    fn forward(&self, what_nk: &Tensor) -> Result<Tensor> {
        self.out.forward(&self.net.forward(what_nk)?)
    }

    fn dim_latent(&self) -> usize {
        self.dim_latent
    }

    fn dim_glimpse(&self) -> usize {
        self.dim_glimpse
    }
}

/// MLP baseline over the observation, the trajectory latents and the final
/// recurrent state.
pub struct BaselineNet {
    net: Mlp,
    out: Linear,
}

impl BaselineNet {
    /// * `dim_obs` - flattened image size
    /// * `max_steps` - trajectory length
    /// * `n_what` - appearance code size
    /// * `dim_hidden` - recurrent state size
    pub fn new(
        dim_obs: usize,
        max_steps: usize,
        n_what: usize,
        dim_hidden: usize,
        dims: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let dim_in = dim_obs + max_steps * (n_what + 4 + 1) + dim_hidden;
        let net = Mlp::new(dim_in, dims, vb.pp("net"))?;
        let out = candle_nn::linear(net.dim_out(), 1, vb.pp("out"))?;
        Ok(Self { net, out })
    }
}

impl BaselineModuleT for BaselineNet {
    fn forward(
        &self,
        obs_nf: &Tensor,
        what_nsk: &Tensor,
        where_ns4: &Tensor,
        presence_ns1: &Tensor,
        hidden_nh: &Tensor,
    ) -> Result<Tensor> {
        let inpt = Tensor::cat(
            &[
                obs_nf,
                &what_nsk.flatten_from(1)?,
                &where_ns4.flatten_from(1)?,
                &presence_ns1.flatten_from(1)?,
                hidden_nh,
            ],
            1,
        )?;
        self.out.forward(&self.net.forward(&inpt)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn gru_cell_preserves_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gru = GruCell::new(5, 3, vb)?;
        let x = Tensor::randn(0f32, 1f32, (4, 5), &Device::Cpu)?;
        let h = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
        let (out, h_next) = gru.forward(&x, &h)?;
        assert_eq!(out.dims(), &[4, 3]);
        assert_eq!(h_next.dims(), &[4, 3]);
        Ok(())
    }

    #[test]
    fn parametrised_gaussian_scale_is_positive() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ParametrisedGaussian::new(6, 3, 0.5, vb)?;
        let feat = Tensor::randn(0f32, 10f32, (8, 6), &Device::Cpu)?;
        let (loc, scale) = head.params(&feat)?;
        assert_eq!(loc.dims(), &[8, 3]);
        let min_scale: f32 = scale.min_all()?.to_scalar()?;
        assert!(min_scale > 0.);
        Ok(())
    }

    #[test]
    fn steps_predictor_outputs_probabilities() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let predictor = StepsPredictorNet::new(7, &[9], vb)?;
        let h = Tensor::randn(0f32, 5f32, (6, 7), &Device::Cpu)?;
        let prob = predictor.forward(&h)?;
        assert_eq!(prob.dims(), &[6, 1]);
        let lo: f32 = prob.min_all()?.to_scalar()?;
        let hi: f32 = prob.max_all()?.to_scalar()?;
        assert!((0. ..=1.).contains(&lo));
        assert!((0. ..=1.).contains(&hi));
        Ok(())
    }

    #[test]
    fn softplus_matches_naive_form() -> Result<()> {
        let x = Tensor::from_vec(vec![-3f32, -0.5, 0., 0.5, 3.], 5, &Device::Cpu)?;
        let got = softplus(&x)?.to_vec1::<f32>()?;
        for (g, v) in got.iter().zip([-3f32, -0.5, 0., 0.5, 3.]) {
            let expected = (1. + v.exp()).ln();
            assert!((g - expected).abs() < 1e-5);
        }
        Ok(())
    }
}
