//! Model-level unrolling and the output distribution.

use candle_core::{Result, Tensor, Var};
use candle_nn::{ops, VarBuilder};

use crate::cell::{AirCell, AirModules, StepOutput};
use crate::config::AirModelConfig;
use crate::loss::normal_log_prob;
use crate::prior::NumStepsDistribution;

/// Full trajectory of one forward pass, step axis leading.
///
/// This is the record shared between the generative model and the objective;
/// everything the loss needs is here, nothing is re-derived downstream.
pub struct AirOutput {
    pub what_snk: Tensor,
    pub what_loc_snk: Tensor,
    pub what_scale_snk: Tensor,
    pub where_sn4: Tensor,
    pub where_loc_sn4: Tensor,
    pub where_scale_sn4: Tensor,
    pub presence_prob_sn1: Tensor,
    pub presence_sn1: Tensor,
    /// Presence-masked, sigmoid-squashed glimpses for inspection.
    pub glimpse_snhw: Tensor,
    /// Final canvas scaled by the output multiplier; the mean of the output
    /// distribution.
    pub canvas_nhw: Tensor,
    /// Final recurrent state.
    pub hidden_nh: Tensor,
    /// Realized number of steps per sample (float-valued integers).
    pub num_steps_n: Tensor,
    /// Stick-breaking posterior over the step count.
    pub num_steps_posterior: NumStepsDistribution,
}

/// Unrolls the inference cell a fixed number of times and forms the output
/// distribution. The recurrence is driven entirely by cell state; there is no
/// per-step external input.
pub struct AirModel {
    cell: AirCell,
    config: AirModelConfig,
    /// Canvas multiplier; runtime-settable, excluded from gradient training.
    output_multiplier: Var,
}

fn stack_field<F>(steps: &[StepOutput], field: F) -> Result<Tensor>
where
    F: Fn(&StepOutput) -> &Tensor,
{
    let tensors: Vec<&Tensor> = steps.iter().map(field).collect();
    Tensor::stack(&tensors, 0)
}

impl AirModel {
    pub fn new(config: AirModelConfig, modules: AirModules, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(candle_core::Error::from)?;
        let cell = AirCell::new(&config, modules, vb.pp("cell"))?;
        let multiplier = Tensor::new(config.output_multiplier as f32, vb.device())?;
        let output_multiplier = Var::from_tensor(&multiplier)?;
        Ok(Self {
            cell,
            config,
            output_multiplier,
        })
    }

    pub fn config(&self) -> &AirModelConfig {
        &self.config
    }

    pub fn max_steps(&self) -> usize {
        self.config.max_steps
    }

    pub fn dim_hidden(&self) -> usize {
        self.cell.dim_hidden()
    }

    pub fn output_multiplier(&self) -> Result<f32> {
        self.output_multiplier.as_tensor().to_scalar()
    }

    /// Replaces the canvas multiplier without touching the rest of the model.
    pub fn set_output_multiplier(&self, value: f64) -> Result<()> {
        let device = self.output_multiplier.as_tensor().device().clone();
        self.output_multiplier
            .set(&Tensor::new(value as f32, &device)?)
    }

    /// Runs the full unroll.
    ///
    /// * `obs_nhw` - observed images (n x img_h x img_w)
    /// * `train` - sample latents and presence bits; off uses posterior means
    ///   and thresholded continuation decisions
    pub fn forward(&self, obs_nhw: &Tensor, train: bool) -> Result<AirOutput> {
        let (n, _, _) = obs_nhw.dims3()?;
        let (h, w) = self.config.img_size;
        let (gh, gw) = self.config.glimpse_size;
        let s = self.config.max_steps;

        let mut state = self.cell.initial_state(obs_nhw)?;
        let mut steps = Vec::with_capacity(s);
        for _ in 0..s {
            let (output, next) = self.cell.step(&state, train)?;
            steps.push(output);
            state = next;
        }

        let presence_sn1 = stack_field(&steps, |o| &o.presence_n1)?;
        let presence_prob_sn1 = stack_field(&steps, |o| &o.presence_prob_n1)?;

        let glimpse_snf = ops::sigmoid(&stack_field(&steps, |o| &o.glimpse_nf)?)?
            .broadcast_mul(&presence_sn1)?;
        let glimpse_snhw = glimpse_snf.reshape((s, n, gh, gw))?;

        let canvas_nhw = state
            .canvas_nf
            .reshape((n, h, w))?
            .broadcast_mul(self.output_multiplier.as_tensor())?;

        let prob_ns = presence_prob_sn1.squeeze(2)?.t()?.contiguous()?;
        let num_steps_posterior = NumStepsDistribution::new(prob_ns);
        let num_steps_n = presence_sn1.sum(0)?.squeeze(1)?;

        Ok(AirOutput {
            what_snk: stack_field(&steps, |o| &o.what_nk)?,
            what_loc_snk: stack_field(&steps, |o| &o.what_loc_nk)?,
            what_scale_snk: stack_field(&steps, |o| &o.what_scale_nk)?,
            where_sn4: stack_field(&steps, |o| &o.where_n4)?,
            where_loc_sn4: stack_field(&steps, |o| &o.where_loc_n4)?,
            where_scale_sn4: stack_field(&steps, |o| &o.where_scale_n4)?,
            presence_prob_sn1,
            presence_sn1,
            glimpse_snhw,
            canvas_nhw,
            hidden_nh: state.hidden_nh,
            num_steps_n,
            num_steps_posterior,
        })
    }

    /// Log-likelihood of the observation under the per-pixel Normal output
    /// distribution, summed over pixels. Shape (n).
    pub fn rec_log_prob_per_sample(&self, output: &AirOutput, obs_nhw: &Tensor) -> Result<Tensor> {
        normal_log_prob(obs_nhw, &output.canvas_nhw, self.config.output_std)?
            .flatten_from(1)?
            .sum(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{Encoder, GlimpseDecoderNet, GruCell, StepsPredictorNet, TransformParamNet};
    use crate::spatial::GridWarper;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn build_model(device: &Device, varmap: &VarMap) -> Result<AirModel> {
        let config = AirModelConfig {
            max_steps: 3,
            img_size: (5, 7),
            glimpse_size: (2, 2),
            n_what: 4,
            output_std: 0.3,
            discrete_steps: true,
            output_multiplier: 1.,
            explore_eps: Some(1e-3),
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let n_pix = config.img_size.0 * config.img_size.1;
        let n_glimpse = config.glimpse_size.0 * config.glimpse_size.1;
        let modules = AirModules {
            transition: Box::new(GruCell::new(6, 8, vb.pp("transition"))?),
            input_encoder: Box::new(Encoder::new(n_pix, &[6], vb.pp("input_enc"))?),
            glimpse_encoder: Box::new(Encoder::new(n_glimpse, &[7], vb.pp("glimpse_enc"))?),
            glimpse_decoder: Box::new(GlimpseDecoderNet::new(
                config.n_what,
                &[7],
                config.glimpse_size,
                vb.pp("decoder"),
            )?),
            transform_estimator: Box::new(TransformParamNet::new(8, &[9], 0.5, vb.pp("where"))?),
            steps_predictor: Box::new(StepsPredictorNet::new(8, &[5], vb.pp("steps"))?),
            warper: Box::new(GridWarper::new(config.img_size, config.glimpse_size)),
        };
        AirModel::new(config, modules, vb.pp("air"))
    }

    #[test]
    fn forward_produces_full_trajectory() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&device, &varmap)?;
        let obs = Tensor::rand(0f32, 1f32, (10, 5, 7), &device)?;
        let output = model.forward(&obs, true)?;

        assert_eq!(output.what_snk.dims(), &[3, 10, 4]);
        assert_eq!(output.where_loc_sn4.dims(), &[3, 10, 4]);
        assert_eq!(output.presence_sn1.dims(), &[3, 10, 1]);
        assert_eq!(output.glimpse_snhw.dims(), &[3, 10, 2, 2]);
        assert_eq!(output.canvas_nhw.dims(), &[10, 5, 7]);
        assert_eq!(output.num_steps_n.dims(), &[10]);

        let rec = model.rec_log_prob_per_sample(&output, &obs)?;
        assert_eq!(rec.dims(), &[10]);
        Ok(())
    }

    #[test]
    fn posterior_rows_sum_to_one_after_forward() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&device, &varmap)?;
        let obs = Tensor::rand(0f32, 1f32, (4, 5, 7), &device)?;
        let output = model.forward(&obs, true)?;
        for total in output.num_steps_posterior.prob()?.sum(1)?.to_vec1::<f32>()? {
            assert!((total - 1.).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn eval_forward_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&device, &varmap)?;
        let obs = Tensor::rand(0f32, 1f32, (4, 5, 7), &device)?;
        let a = model.forward(&obs, false)?;
        let b = model.forward(&obs, false)?;
        let diff: f32 = (a.canvas_nhw - &b.canvas_nhw)?.abs()?.sum_all()?.to_scalar()?;
        assert_eq!(diff, 0.);
        Ok(())
    }

    #[test]
    fn output_multiplier_scales_canvas() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&device, &varmap)?;
        let obs = Tensor::rand(0f32, 1f32, (2, 5, 7), &device)?;
        let base = model.forward(&obs, false)?;
        model.set_output_multiplier(2.)?;
        let scaled = model.forward(&obs, false)?;
        let diff: f32 = ((base.canvas_nhw * 2.)? - &scaled.canvas_nhw)?
            .abs()?
            .sum_all()?
            .to_scalar()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
