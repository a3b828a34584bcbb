//! Per-step inference state machine.
//!
//! Each step decides whether another object is present, infers its
//! appearance and pose, and composites its rendered glimpse onto the shared
//! canvas. The unrolling loop in [`crate::model`] owns the state; the cell
//! itself is a pure step function.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::AirModelConfig;
use crate::error::AirError;
use crate::model_traits::{
    FeatureEncoderT, GlimpseDecoderT, SpatialTransformerT, StepsPredictorT, TransformEstimatorT,
    TransitionModuleT,
};
use crate::modules::{sample_normal, ParametrisedGaussian};

/// Bundle of the pluggable collaborator modules consumed by the cell.
pub struct AirModules {
    pub transition: Box<dyn TransitionModuleT>,
    pub input_encoder: Box<dyn FeatureEncoderT>,
    pub glimpse_encoder: Box<dyn FeatureEncoderT>,
    pub glimpse_decoder: Box<dyn GlimpseDecoderT>,
    pub transform_estimator: Box<dyn TransformEstimatorT>,
    pub steps_predictor: Box<dyn StepsPredictorT>,
    pub warper: Box<dyn SpatialTransformerT>,
}

/// Recurrent state threaded through the unrolled steps.
pub struct AirState {
    /// Flattened observation (n x img_h * img_w); constant across steps.
    pub obs_nf: Tensor,
    /// Accumulated reconstruction canvas (n x img_h * img_w).
    pub canvas_nf: Tensor,
    /// Transition hidden state (n x h).
    pub hidden_nh: Tensor,
    /// Presence indicator carried forward; non-increasing over steps.
    pub presence_n1: Tensor,
}

/// Everything one step exports to the objective.
pub struct StepOutput {
    pub what_nk: Tensor,
    pub what_loc_nk: Tensor,
    pub what_scale_nk: Tensor,
    pub where_n4: Tensor,
    pub where_loc_n4: Tensor,
    pub where_scale_n4: Tensor,
    pub presence_prob_n1: Tensor,
    pub presence_n1: Tensor,
    /// Raw decoded glimpse pixels (n x glimpse_h * glimpse_w).
    pub glimpse_nf: Tensor,
}

pub struct AirCell {
    img_size: (usize, usize),
    glimpse_size: (usize, usize),
    n_what: usize,
    discrete_steps: bool,
    explore_eps: Option<f64>,
    modules: AirModules,
    what_head: ParametrisedGaussian,
}

impl std::fmt::Debug for AirCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirCell")
            .field("img_size", &self.img_size)
            .field("glimpse_size", &self.glimpse_size)
            .field("n_what", &self.n_what)
            .field("discrete_steps", &self.discrete_steps)
            .field("explore_eps", &self.explore_eps)
            .finish_non_exhaustive()
    }
}

fn ensure_dims(got: &Tensor, expected: (usize, usize), what: &str) -> Result<()> {
    if got.dims2()? != expected {
        return Err(AirError::ShapeMismatch(format!(
            "{} has shape {:?}, expected {:?}",
            what,
            got.dims(),
            expected
        ))
        .into());
    }
    Ok(())
}

impl AirCell {
    /// Checks every collaborator's declared dimensions against the
    /// configuration before anything runs; a disagreement here would only
    /// surface later as an opaque matmul failure.
    pub fn new(config: &AirModelConfig, modules: AirModules, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(candle_core::Error::from)?;

        let n_pix = config.img_size.0 * config.img_size.1;
        let n_glimpse = config.glimpse_size.0 * config.glimpse_size.1;
        if modules.input_encoder.dim_input() != n_pix {
            return Err(AirError::ShapeMismatch(format!(
                "input encoder expects {} inputs, image has {} pixels",
                modules.input_encoder.dim_input(),
                n_pix
            ))
            .into());
        }
        if modules.glimpse_encoder.dim_input() != n_glimpse {
            return Err(AirError::ShapeMismatch(format!(
                "glimpse encoder expects {} inputs, glimpse has {} pixels",
                modules.glimpse_encoder.dim_input(),
                n_glimpse
            ))
            .into());
        }
        if modules.glimpse_decoder.dim_glimpse() != n_glimpse {
            return Err(AirError::ShapeMismatch(format!(
                "glimpse decoder renders {} pixels, glimpse has {}",
                modules.glimpse_decoder.dim_glimpse(),
                n_glimpse
            ))
            .into());
        }
        if modules.glimpse_decoder.dim_latent() != config.n_what {
            return Err(AirError::ShapeMismatch(format!(
                "glimpse decoder consumes {} latents, n_what is {}",
                modules.glimpse_decoder.dim_latent(),
                config.n_what
            ))
            .into());
        }

        let what_head = ParametrisedGaussian::new(
            modules.glimpse_encoder.dim_output(),
            config.n_what,
            0.5,
            vb.pp("what"),
        )?;

        Ok(Self {
            img_size: config.img_size,
            glimpse_size: config.glimpse_size,
            n_what: config.n_what,
            discrete_steps: config.discrete_steps,
            explore_eps: config.explore_eps,
            modules,
            what_head,
        })
    }

    pub fn n_what(&self) -> usize {
        self.n_what
    }

    pub fn dim_hidden(&self) -> usize {
        self.modules.transition.dim_hidden()
    }

    /// Zero canvas, all samples active, zero recurrent state.
    pub fn initial_state(&self, obs_nhw: &Tensor) -> Result<AirState> {
        let (n, h, w) = obs_nhw.dims3()?;
        if (h, w) != self.img_size {
            return Err(AirError::ShapeMismatch(format!(
                "observation is {}x{}, model configured for {}x{}",
                h, w, self.img_size.0, self.img_size.1
            ))
            .into());
        }
        let obs_nf = obs_nhw.flatten_from(1)?;
        let canvas_nf = obs_nf.zeros_like()?;
        let hidden_nh = Tensor::zeros(
            (n, self.modules.transition.dim_hidden()),
            obs_nf.dtype(),
            obs_nf.device(),
        )?;
        let presence_n1 = Tensor::ones((n, 1), obs_nf.dtype(), obs_nf.device())?;
        Ok(AirState {
            obs_nf,
            canvas_nf,
            hidden_nh,
            presence_n1,
        })
    }

    /// One inference step.
    ///
    /// With `train` the latents are reparameterized samples and the presence
    /// bit is Bernoulli-sampled; otherwise posterior means are used and the
    /// continuation decision is thresholded at 0.5.
    pub fn step(&self, state: &AirState, train: bool) -> Result<(StepOutput, AirState)> {
        let (n, _) = state.obs_nf.dims2()?;
        let (h, w) = self.img_size;
        let (gh, gw) = self.glimpse_size;
        let dim_hidden = self.modules.transition.dim_hidden();

        let residual_nf = (&state.obs_nf - &state.canvas_nf)?;
        let encoded_nf = self.modules.input_encoder.forward(&residual_nf)?;
        let (rnn_out_nh, hidden_nh) = self
            .modules
            .transition
            .forward(&encoded_nf, &state.hidden_nh)?;
        ensure_dims(&rnn_out_nh, (n, dim_hidden), "transition output")?;

        let (where_loc_n4, where_scale_n4) =
            self.modules.transform_estimator.forward(&rnn_out_nh)?;
        ensure_dims(&where_loc_n4, (n, 4), "pose location")?;
        ensure_dims(&where_scale_n4, (n, 4), "pose scale")?;
        let where_n4 = sample_normal(&where_loc_n4, &where_scale_n4, train)?;

        let obs_nhw = state.obs_nf.reshape((n, h, w))?;
        let crop_nhw = self.modules.warper.extract(&obs_nhw, &where_n4)?;
        let crop_feat = self
            .modules
            .glimpse_encoder
            .forward(&crop_nhw.flatten_from(1)?)?;
        let (what_loc_nk, what_scale_nk) = self.what_head.params(&crop_feat)?;
        let what_nk = sample_normal(&what_loc_nk, &what_scale_nk, train)?;

        let glimpse_nf = self.modules.glimpse_decoder.forward(&what_nk)?;
        ensure_dims(&glimpse_nf, (n, gh * gw), "decoded glimpse")?;
        let rendered_nhw = self
            .modules
            .warper
            .render(&glimpse_nf.reshape((n, gh, gw))?, &where_n4)?;

        let mut presence_prob_n1 = self.modules.steps_predictor.forward(&rnn_out_nh)?;
        ensure_dims(&presence_prob_n1, (n, 1), "continuation probability")?;
        if let Some(eps) = self.explore_eps {
            presence_prob_n1 = presence_prob_n1.affine(1. - eps, eps / 2.)?;
        }

        let continue_n1 = if self.discrete_steps {
            if train {
                let u_n1 = presence_prob_n1.rand_like(0., 1.)?;
                u_n1.lt(&presence_prob_n1)?.to_dtype(state.obs_nf.dtype())?
            } else {
                presence_prob_n1.ge(0.5)?.to_dtype(state.obs_nf.dtype())?
            }
        } else {
            presence_prob_n1.clone()
        };
        // once a sample has stopped it stays stopped
        let presence_n1 = (&state.presence_n1 * continue_n1)?;

        let canvas_nf = (&state.canvas_nf
            + rendered_nhw.flatten_from(1)?.broadcast_mul(&presence_n1)?)?;

        let output = StepOutput {
            what_nk,
            what_loc_nk,
            what_scale_nk,
            where_n4,
            where_loc_n4,
            where_scale_n4,
            presence_prob_n1,
            presence_n1: presence_n1.clone(),
            glimpse_nf,
        };
        let next = AirState {
            obs_nf: state.obs_nf.clone(),
            canvas_nf,
            hidden_nh,
            presence_n1,
        };
        Ok((output, next))
    }
}
