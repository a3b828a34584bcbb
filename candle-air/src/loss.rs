use candle_core::{Result, Tensor};

use crate::error::AirError;

/// Weighted-sum accumulator tracking a scalar batch-mean loss alongside the
/// per-sample vector loss. Score-function estimators need the per-sample
/// quantities while summaries report scalars, so the two are kept in lockstep.
///
/// Every added per-sample vector must have the same shape as the ones already
/// accumulated; a batch-size disagreement is a construction bug, not a
/// runtime condition, and fails immediately.
#[derive(Default)]
pub struct Loss {
    value: Option<Tensor>,
    per_sample: Option<Tensor>,
}

impl Loss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a weighted component.
    ///
    /// * `value` - scalar batch mean
    /// * `per_sample` - per-sample vector (n)
    /// * `weight` - multiplier applied to both
    pub fn add(&mut self, value: &Tensor, per_sample: &Tensor, weight: f64) -> Result<()> {
        self.value = Some(Self::accumulate(self.value.take(), value, weight)?);
        self.per_sample = Some(Self::accumulate(self.per_sample.take(), per_sample, weight)?);
        Ok(())
    }

    /// Fold another accumulator in, scaling both of its aggregates.
    pub fn add_loss(&mut self, other: &Loss, weight: f64) -> Result<()> {
        match (&other.value, &other.per_sample) {
            (Some(value), Some(per_sample)) => self.add(value, per_sample, weight),
            _ => Ok(()),
        }
    }

    fn accumulate(current: Option<Tensor>, term: &Tensor, weight: f64) -> Result<Tensor> {
        let term = (term * weight)?;
        match current {
            None => Ok(term),
            Some(current) => {
                if current.dims() != term.dims() {
                    return Err(AirError::ShapeMismatch(format!(
                        "loss term has shape {:?}, accumulated shape is {:?}",
                        term.dims(),
                        current.dims()
                    ))
                    .into());
                }
                current + term
            }
        }
    }

    /// Scalar aggregate; zero if nothing was accumulated.
    pub fn value(&self, device: &candle_core::Device) -> Result<Tensor> {
        match &self.value {
            Some(value) => Ok(value.clone()),
            None => Tensor::zeros((), candle_core::DType::F32, device),
        }
    }

    pub fn per_sample(&self) -> Option<&Tensor> {
        self.per_sample.as_ref()
    }
}

/// Elementwise log-density of a Normal with fixed scalar deviation.
///
/// log N(x; mu, std) = -0.5 ((x - mu)/std)^2 - ln(std) - 0.5 ln(2 pi)
pub fn normal_log_prob(x: &Tensor, mean: &Tensor, std: f64) -> Result<Tensor> {
    let ln_2pi = (2. * std::f64::consts::PI).ln();
    ((x - mean)? / std)?
        .sqr()?
        .affine(-0.5, -(std.ln() + 0.5 * ln_2pi))
}

/// Elementwise KL divergence between diagonal Normal distributions.
///
/// KL(q || p) = ln(p_scale/q_scale)
///              + (q_scale^2 + (q_loc - p_loc)^2) / (2 p_scale^2) - 1/2
///
/// Broadcasting applies, so priors may be scalars (rank 0) or full tensors.
pub fn normal_kl(
    q_loc: &Tensor,
    q_scale: &Tensor,
    p_loc: &Tensor,
    p_scale: &Tensor,
) -> Result<Tensor> {
    let scale_ratio_sq = q_scale.broadcast_div(p_scale)?.sqr()?;
    let mean_term_sq = q_loc.broadcast_sub(p_loc)?.broadcast_div(p_scale)?.sqr()?;
    ((scale_ratio_sq.log()?.neg()? + scale_ratio_sq)? + mean_term_sq)?.affine(0.5, -0.5)
}

/// Exponential moving average kept in host double precision.
///
/// value <- decay * value + (1 - decay) * observed
#[derive(Debug, Clone, Copy)]
pub struct MovingAverage {
    value: f64,
    decay: f64,
}

impl MovingAverage {
    pub fn new(init: f64, decay: f64) -> Self {
        Self { value: init, decay }
    }

    pub fn update(&mut self, observed: f64) -> f64 {
        self.value = self.decay * self.value + (1. - self.decay) * observed;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn loss_accumulates_weighted_components() -> Result<()> {
        let device = Device::Cpu;
        let mut loss = Loss::new();
        let ps_a = Tensor::from_vec(vec![1f32, 2., 3.], 3, &device)?;
        let ps_b = Tensor::from_vec(vec![1f32, 1., 1.], 3, &device)?;
        loss.add(&ps_a.mean_all()?, &ps_a, 1.)?;
        loss.add(&ps_b.mean_all()?, &ps_b, 2.)?;

        let value: f32 = loss.value(&device)?.to_scalar()?;
        assert_abs_diff_eq!(value, 4.0, epsilon = 1e-6);
        let per_sample = loss.per_sample().unwrap().to_vec1::<f32>()?;
        assert_eq!(per_sample, vec![3., 4., 5.]);
        Ok(())
    }

    #[test]
    fn loss_rejects_batch_size_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let mut loss = Loss::new();
        let ps_3 = Tensor::zeros(3, candle_core::DType::F32, &device)?;
        let ps_4 = Tensor::zeros(4, candle_core::DType::F32, &device)?;
        loss.add(&ps_3.mean_all()?, &ps_3, 1.)?;
        let err = loss.add(&ps_4.mean_all()?, &ps_4, 1.).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
        Ok(())
    }

    #[test]
    fn empty_loss_reads_as_zero() -> Result<()> {
        let device = Device::Cpu;
        let loss = Loss::new();
        let value: f32 = loss.value(&device)?.to_scalar()?;
        assert_eq!(value, 0.);
        Ok(())
    }

    #[test]
    fn normal_kl_zero_for_identical() -> Result<()> {
        let device = Device::Cpu;
        let loc = Tensor::randn(0f32, 1f32, (4, 3), &device)?;
        let scale = Tensor::rand(0.5f32, 1.5f32, (4, 3), &device)?;
        let kl: f32 = normal_kl(&loc, &scale, &loc, &scale)?
            .abs()?
            .sum_all()?
            .to_scalar()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn normal_log_prob_standard_normal_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((1,), candle_core::DType::F32, &device)?;
        let lp: f32 = normal_log_prob(&x, &x, 1.)?.sum_all()?.to_scalar()?;
        let expected = -0.5 * (2. * std::f64::consts::PI).ln();
        assert_abs_diff_eq!(lp, expected as f32, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn moving_average_converges() {
        let mut ma = MovingAverage::new(0., 0.9);
        for _ in 0..500 {
            ma.update(2.);
        }
        assert_abs_diff_eq!(ma.value(), 2.0, epsilon = 1e-4);
    }
}
