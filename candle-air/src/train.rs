//! Objective assembly and the coupled optimization steps.
//!
//! One forward pass feeds both parameter updates: the main step optimizes
//! reconstruction + gated KL terms + the score-function surrogate (+ L2),
//! the baseline step regresses the control variate against the same
//! importance weights. Both run inside a single `train_step` call so the
//! variance reduction sees exactly the values the estimator used.

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::config::{PriorToggle, TrainConfig};
use crate::error::AirError;
use crate::loss::{normal_kl, Loss, MovingAverage};
use crate::model::{AirModel, AirOutput};
use crate::model_traits::BaselineModuleT;
use crate::prior::{geometric_prior, posterior_tail_weights, tabular_kl};
use crate::schedule::anneal_weight;

/// Dotted scope under which a baseline module must create its parameters.
/// The baseline is trained by its own optimizer and excluded from the main
/// update and the L2 penalty.
pub const BASELINE_SCOPE: &str = "baseline";

/// Per-step reported quantities. `loss` is the variational (reconstruction +
/// gated KL) objective; `opt_loss` additionally carries the score-function
/// surrogate and the L2 penalty and is what gradients are taken of.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub rec_loss: f32,
    pub loss: f32,
    pub opt_loss: f32,
    pub prior_loss: f32,
    pub kl_num_steps: f32,
    pub kl_what: f32,
    pub kl_where: f32,
    pub reinforce_loss: f32,
    pub baseline_loss: f32,
    pub l2_loss: f32,
    pub num_steps: f32,
    pub steps_prior_success_prob: f32,
}

struct PriorTerms {
    loss: Loss,
    kl_num_steps: f32,
    kl_what: f32,
    kl_where: f32,
    success_prob: Option<f64>,
}

pub struct AirTrainer {
    model: AirModel,
    config: TrainConfig,
    baseline: Option<Box<dyn BaselineModuleT>>,
    main_opt: AdamW,
    baseline_opt: Option<AdamW>,
    l2_vars: Vec<Var>,
    use_prior: PriorToggle,
    imp_weight_mean: MovingAverage,
    imp_weight_var: MovingAverage,
    global_step: usize,
}

impl AirTrainer {
    /// Validates the configuration and partitions the variable map into the
    /// baseline scope and everything else, one `AdamW` per partition. Fails
    /// before any step runs; a bad prior record or a baseline without
    /// parameters is a structural error, not a runtime one.
    pub fn new(
        model: AirModel,
        varmap: &VarMap,
        baseline: Option<Box<dyn BaselineModuleT>>,
        config: TrainConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let mut main_vars = Vec::new();
        let mut baseline_vars = Vec::new();
        {
            let data = varmap.data().lock().expect("variable map lock");
            for (name, var) in data.iter() {
                if name.starts_with(&format!("{}.", BASELINE_SCOPE)) {
                    baseline_vars.push(var.clone());
                } else {
                    main_vars.push(var.clone());
                }
            }
        }
        if main_vars.is_empty() {
            return Err(AirError::Configuration("no trainable parameters".into()).into());
        }
        if baseline.is_some() && baseline_vars.is_empty() {
            return Err(AirError::Configuration(format!(
                "baseline module must create its parameters under the `{}` scope",
                BASELINE_SCOPE
            ))
            .into());
        }

        // biases are not penalized
        let l2_vars = main_vars
            .iter()
            .filter(|v| v.as_tensor().rank() == 2)
            .cloned()
            .collect();

        let main_opt = AdamW::new_lr(main_vars, config.learning_rate)?;
        let baseline_opt = match &baseline {
            Some(_) => Some(AdamW::new_lr(
                baseline_vars,
                config.learning_rate * config.baseline_lr_multiplier,
            )?),
            None => None,
        };

        let decay = config.decay_rate.unwrap_or(0.9);
        let use_prior = PriorToggle::new(config.use_prior);
        Ok(Self {
            model,
            config,
            baseline,
            main_opt,
            baseline_opt,
            l2_vars,
            use_prior,
            imp_weight_mean: MovingAverage::new(0., decay),
            imp_weight_var: MovingAverage::new(1., decay),
            global_step: 0,
        })
    }

    pub fn model(&self) -> &AirModel {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Shared handle to the runtime KL gate.
    pub fn prior_toggle(&self) -> PriorToggle {
        self.use_prior.clone()
    }

    /// KL terms of the variational objective for one forward pass.
    fn prior_terms(&self, output: &AirOutput, device: &Device) -> Result<PriorTerms> {
        let max_steps = self.model.max_steps();
        let posterior_prob_nk = output.num_steps_posterior.prob()?;

        let mut loss = Loss::new();
        let mut kl_num_steps = 0f32;
        let mut kl_what = 0f32;
        let mut kl_where = 0f32;
        let mut success_prob = None;

        if let Some(nsp) = &self.config.num_steps_prior {
            let prob = match &nsp.anneal {
                Some(anneal) => anneal_weight(
                    nsp.init,
                    anneal.final_value,
                    anneal.kind,
                    self.global_step as f64,
                    anneal.steps,
                    anneal.hold_init,
                    anneal.steps_div,
                ),
                None => nsp.init,
            };
            success_prob = Some(prob);

            let prior_k = geometric_prior(prob, max_steps, device)?;
            let steps_kl_n = tabular_kl(&posterior_prob_nk, &prior_k)?.sum(1)?;
            let steps_kl = steps_kl_n.mean_all()?;
            kl_num_steps = steps_kl.to_scalar()?;
            loss.add(&steps_kl, &steps_kl_n, nsp.weight)?;
        }

        // expectation weight for the conditional KL terms: exact posterior
        // tail mass under the analytic step-count prior, otherwise the
        // realized presence indicators
        let analytic = self
            .config
            .num_steps_prior
            .as_ref()
            .map(|nsp| nsp.analytic)
            .unwrap_or(false);
        let step_weight_sn = if analytic {
            posterior_tail_weights(&posterior_prob_nk, max_steps)?
        } else {
            output.presence_sn1.squeeze(2)?
        };

        if let Some(what_prior) = &self.config.what_prior {
            let p_loc = Tensor::new(what_prior.loc as f32, device)?;
            let p_scale = Tensor::new(what_prior.scale as f32, device)?;
            let kl_snk = normal_kl(
                &output.what_loc_snk,
                &output.what_scale_snk,
                &p_loc,
                &p_scale,
            )?;
            let kl_n = (kl_snk.sum(2)? * &step_weight_sn)?.sum(0)?;
            let kl = kl_n.mean_all()?;
            kl_what = kl.to_scalar()?;
            loss.add(&kl, &kl_n, 1.)?;
        }

        if let (Some(scale_prior), Some(shift_prior)) =
            (&self.config.where_scale_prior, &self.config.where_shift_prior)
        {
            // pose components in fixed order: scale-x, shift-x, scale-y, shift-y
            let loc = &output.where_loc_sn4;
            let scale = &output.where_scale_sn4;
            let scale_loc = Tensor::cat(&[loc.narrow(2, 0, 1)?, loc.narrow(2, 2, 1)?], 2)?;
            let scale_scale = Tensor::cat(&[scale.narrow(2, 0, 1)?, scale.narrow(2, 2, 1)?], 2)?;
            let shift_loc = Tensor::cat(&[loc.narrow(2, 1, 1)?, loc.narrow(2, 3, 1)?], 2)?;
            let shift_scale = Tensor::cat(&[scale.narrow(2, 1, 1)?, scale.narrow(2, 3, 1)?], 2)?;

            let p_loc = Tensor::new(scale_prior.loc as f32, device)?;
            let p_scale = Tensor::new(scale_prior.scale as f32, device)?;
            let scale_kl = normal_kl(&scale_loc, &scale_scale, &p_loc, &p_scale)?;

            // without an explicit location the shift prior centres on the
            // posterior's own location and only the scale is regularized
            let shift_p_loc = match shift_prior.loc {
                Some(loc) => Tensor::new(loc as f32, device)?,
                None => shift_loc.clone(),
            };
            let shift_p_scale = Tensor::new(shift_prior.scale as f32, device)?;
            let shift_kl = normal_kl(&shift_loc, &shift_scale, &shift_p_loc, &shift_p_scale)?;

            let kl_n = ((scale_kl + shift_kl)?.sum(2)? * &step_weight_sn)?.sum(0)?;
            let kl = kl_n.mean_all()?;
            kl_where = kl.to_scalar()?;
            loss.add(&kl, &kl_n, 1.)?;
        }

        Ok(PriorTerms {
            loss,
            kl_num_steps,
            kl_what,
            kl_where,
            success_prob,
        })
    }

    /// One coupled optimization step over a batch of observations.
    pub fn train_step(&mut self, obs_nhw: &Tensor) -> anyhow::Result<StepStats> {
        let device = obs_nhw.device().clone();
        let output = self.model.forward(obs_nhw, true)?;

        // reconstruction: -E_q[ log p(x | z, n) ]
        let rec_loss_n = self.model.rec_log_prob_per_sample(&output, obs_nhw)?.neg()?;
        let rec_loss = rec_loss_n.mean_all()?;

        let mut loss = Loss::new();
        loss.add(&rec_loss, &rec_loss_n, 1.)?;

        // KL[ q(z, n | x) || p(z, n) ], gated at runtime
        let prior = self.prior_terms(&output, &device)?;
        let prior_weight = if self.use_prior.get() { 1. } else { 0. };
        loss.add_loss(&prior.loss, prior_weight)?;

        let mut opt_loss = loss.value(&device)?;

        let mut reinforce_loss = 0f32;
        let mut baseline_loss_t: Option<Tensor> = None;
        let use_reinforce = self.config.use_reinforce && self.model.config().discrete_steps;
        if use_reinforce {
            let analytic = self
                .config
                .num_steps_prior
                .as_ref()
                .map(|nsp| nsp.analytic)
                .unwrap_or(true);

            let mut imp_weight_n = rec_loss_n.clone();
            if !analytic {
                if let Some(prior_n) = prior.loss.per_sample() {
                    imp_weight_n = (imp_weight_n + prior_n)?;
                }
            }
            // the baseline regresses the raw signal, before its own
            // prediction is subtracted
            let baseline_target_n = imp_weight_n.detach();

            if let Some(baseline) = &self.baseline {
                let what_nsk = output.what_snk.transpose(0, 1)?.contiguous()?;
                let where_ns4 = output.where_sn4.transpose(0, 1)?.contiguous()?;
                let presence_ns1 = output.presence_sn1.transpose(0, 1)?.contiguous()?;
                let pred_n = baseline
                    .forward(
                        &obs_nhw.flatten_from(1)?,
                        &what_nsk,
                        &where_ns4,
                        &presence_ns1,
                        &output.hidden_nh,
                    )?
                    .squeeze(1)?;
                imp_weight_n = (imp_weight_n - &pred_n)?;
                let mse = (&baseline_target_n - &pred_n)?.sqr()?.mean_all()?;
                baseline_loss_t = Some((mse * 0.5)?);
            }

            if self.config.decay_rate.is_some() {
                let mean = imp_weight_n.mean_all()?.to_scalar::<f32>()? as f64;
                let sq_mean = imp_weight_n.sqr()?.mean_all()?.to_scalar::<f32>()? as f64;
                let mean_ma = self.imp_weight_mean.update(mean);
                let var_ma = self.imp_weight_var.update((sq_mean - mean * mean).max(0.));
                // variance floor keeps early steps from exploding
                let factor = var_ma.sqrt().max(1.);
                imp_weight_n = ((imp_weight_n - mean_ma)? / factor)?;
            }

            let log_prob_n = output.num_steps_posterior.log_prob(&output.num_steps_n)?;
            let reinforce = (imp_weight_n.detach() * log_prob_n)?.mean_all()?;
            reinforce_loss = reinforce.to_scalar()?;
            opt_loss = (opt_loss + reinforce)?;
        }

        let mut l2_loss = 0f32;
        if self.config.l2_weight > 0. {
            let mut l2: Option<Tensor> = None;
            for var in &self.l2_vars {
                let term = (var.as_tensor().sqr()?.sum_all()? * 0.5)?;
                l2 = Some(match l2 {
                    None => term,
                    Some(acc) => (acc + term)?,
                });
            }
            if let Some(l2) = l2 {
                let l2 = (l2 * self.config.l2_weight)?;
                l2_loss = l2.to_scalar()?;
                opt_loss = (opt_loss + l2)?;
            }
        }

        self.main_opt.backward_step(&opt_loss)?;

        let mut baseline_loss = 0f32;
        if let (Some(opt), Some(bl)) = (self.baseline_opt.as_mut(), &baseline_loss_t) {
            opt.backward_step(bl)?;
            baseline_loss = bl.to_scalar()?;
        }
        self.global_step += 1;

        Ok(StepStats {
            rec_loss: rec_loss.to_scalar()?,
            loss: loss.value(&device)?.to_scalar()?,
            opt_loss: opt_loss.to_scalar()?,
            prior_loss: prior.loss.value(&device)?.to_scalar()?,
            kl_num_steps: prior.kl_num_steps,
            kl_what: prior.kl_what,
            kl_where: prior.kl_where,
            reinforce_loss,
            baseline_loss,
            l2_loss,
            num_steps: output.num_steps_n.mean_all()?.to_scalar()?,
            steps_prior_success_prob: prior.success_prob.map(|p| p as f32).unwrap_or(f32::NAN),
        })
    }

    /// Epoch loop over pre-built observation batches.
    pub fn fit(&mut self, batches: &[Tensor], num_epochs: usize) -> anyhow::Result<Vec<f32>> {
        let pb = ProgressBar::new(num_epochs as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = Vec::with_capacity(num_epochs);
        for epoch in 0..num_epochs {
            let mut total = 0f32;
            for obs in batches {
                total += self.train_step(obs)?.opt_loss;
            }
            trace.push(total / batches.len().max(1) as f32);
            pb.inc(1);
            if self.config.verbose {
                info!(
                    "[{}] objective: {}",
                    epoch + 1,
                    trace.last().ok_or(anyhow::anyhow!("objective trace"))?
                );
            }
        }
        pb.finish_and_clear();
        Ok(trace)
    }
}
