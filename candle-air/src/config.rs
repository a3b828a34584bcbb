use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{config_err, AirError};
use crate::schedule::AnnealKind;

/// Fixed Normal prior over a latent block.
#[derive(Debug, Clone, Copy)]
pub struct NormalPriorConfig {
    pub loc: f64,
    pub scale: f64,
}

/// Prior over the pose shift pair. When `loc` is `None` the prior is centred
/// on the posterior's own location, so only the scale is regularized.
#[derive(Debug, Clone, Copy)]
pub struct ShiftPriorConfig {
    pub loc: Option<f64>,
    pub scale: f64,
}

/// Annealing of the step-count prior success probability.
#[derive(Debug, Clone, Copy)]
pub struct AnnealConfig {
    pub kind: AnnealKind,
    pub final_value: f64,
    pub steps: f64,
    pub hold_init: f64,
    pub steps_div: f64,
}

impl AnnealConfig {
    pub fn new(kind: AnnealKind, final_value: f64, steps: f64) -> Self {
        Self {
            kind,
            final_value,
            steps,
            hold_init: 0.,
            steps_div: 1.,
        }
    }
}

/// Geometric prior over the number of steps.
///
/// `init` is the success probability (probability of continuing for one more
/// step); when `anneal` is set it decays from `init` over training. With
/// `analytic` the conditional KL terms are weighted by the exact posterior
/// tail mass instead of the sampled presence indicators.
#[derive(Debug, Clone, Copy)]
pub struct NumStepsPriorConfig {
    pub init: f64,
    pub weight: f64,
    pub analytic: bool,
    pub anneal: Option<AnnealConfig>,
}

impl NumStepsPriorConfig {
    pub fn fixed(init: f64) -> Self {
        Self {
            init,
            weight: 1.,
            analytic: true,
            anneal: None,
        }
    }
}

/// Model geometry and sampling options.
#[derive(Debug, Clone)]
pub struct AirModelConfig {
    /// Maximum number of inference steps (objects) per image.
    pub max_steps: usize,
    /// Image size (rows, cols).
    pub img_size: (usize, usize),
    /// Attention glimpse size (rows, cols).
    pub glimpse_size: (usize, usize),
    /// Appearance code dimensionality.
    pub n_what: usize,
    /// Std deviation of the output Normal distribution.
    pub output_std: f64,
    /// Sample hard presence bits instead of using probabilities directly.
    pub discrete_steps: bool,
    /// Initial value of the (not gradient-trained) canvas multiplier.
    pub output_multiplier: f64,
    /// Optional exploration floor mixed into the continuation probability.
    pub explore_eps: Option<f64>,
}

impl AirModelConfig {
    pub fn validate(&self) -> Result<(), AirError> {
        if self.max_steps == 0 {
            return config_err("max_steps must be at least 1");
        }
        if self.img_size.0 == 0 || self.img_size.1 == 0 {
            return config_err("img_size must be non-zero");
        }
        if self.glimpse_size.0 == 0 || self.glimpse_size.1 == 0 {
            return config_err("glimpse_size must be non-zero");
        }
        if self.n_what == 0 {
            return config_err("n_what must be at least 1");
        }
        if self.output_std <= 0. {
            return config_err("output_std must be positive");
        }
        if let Some(eps) = self.explore_eps {
            if !(0. ..1.).contains(&eps) {
                return config_err("explore_eps must lie in [0, 1)");
            }
        }
        Ok(())
    }
}

/// Training-objective configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub l2_weight: f64,
    pub what_prior: Option<NormalPriorConfig>,
    pub where_scale_prior: Option<NormalPriorConfig>,
    pub where_shift_prior: Option<ShiftPriorConfig>,
    pub num_steps_prior: Option<NumStepsPriorConfig>,
    /// Initial state of the runtime KL gate.
    pub use_prior: bool,
    /// Train the step-count distribution with the score-function estimator.
    pub use_reinforce: bool,
    /// Decay rate of the importance-weight moving mean/variance; `None`
    /// disables the normalization.
    pub decay_rate: Option<f64>,
    /// Baseline optimizer runs at this multiple of the main learning rate.
    pub baseline_lr_multiplier: f64,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            l2_weight: 0.,
            what_prior: None,
            where_scale_prior: None,
            where_shift_prior: None,
            num_steps_prior: None,
            use_prior: true,
            use_reinforce: true,
            decay_rate: None,
            baseline_lr_multiplier: 10.,
            verbose: false,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), AirError> {
        if self.learning_rate <= 0. {
            return config_err("learning_rate must be positive");
        }
        if self.l2_weight < 0. {
            return config_err("l2_weight must be non-negative");
        }
        if self.baseline_lr_multiplier <= 0. {
            return config_err("baseline_lr_multiplier must be positive");
        }
        if let Some(decay) = self.decay_rate {
            if !(0. ..1.).contains(&decay) {
                return config_err("decay_rate must lie in [0, 1)");
            }
        }
        if let Some(prior) = &self.what_prior {
            if prior.scale <= 0. {
                return config_err("what_prior.scale must be positive");
            }
        }
        if let Some(prior) = &self.where_scale_prior {
            if prior.scale <= 0. {
                return config_err("where_scale_prior.scale must be positive");
            }
        }
        if let Some(prior) = &self.where_shift_prior {
            if prior.scale <= 0. {
                return config_err("where_shift_prior.scale must be positive");
            }
        }
        if let Some(nsp) = &self.num_steps_prior {
            if !(0. ..=1.).contains(&nsp.init) {
                return config_err("num_steps_prior.init must lie in [0, 1]");
            }
            if nsp.weight < 0. {
                return config_err("num_steps_prior.weight must be non-negative");
            }
            if let Some(anneal) = &nsp.anneal {
                if !(0. ..=1.).contains(&anneal.final_value) {
                    return config_err("num_steps_prior.anneal.final_value must lie in [0, 1]");
                }
                if anneal.steps <= 0. {
                    return config_err("num_steps_prior.anneal.steps must be positive");
                }
                if anneal.steps_div <= 0. {
                    return config_err("num_steps_prior.anneal.steps_div must be positive");
                }
                if anneal.hold_init < 0. {
                    return config_err("num_steps_prior.anneal.hold_init must be non-negative");
                }
            }
        }
        Ok(())
    }
}

/// Runtime-mutable flag shared between the trainer and its driver. Flipping
/// it takes effect on the next training step; nothing is rebuilt.
#[derive(Debug, Clone)]
pub struct PriorToggle {
    flag: Arc<AtomicBool>,
}

impl PriorToggle {
    pub fn new(enabled: bool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn get(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        self.flag.store(enabled, Ordering::Relaxed);
    }

    pub fn toggle(&self) {
        self.flag.fetch_xor(true, Ordering::Relaxed);
    }
}
