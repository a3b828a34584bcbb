use candle_core::{DType, Device, Result, Tensor};

/// Probability floor used inside log-space computations. Bins with zero mass
/// contribute exactly zero to KL sums because they multiply the clamped log.
const LOG_EPS: f64 = 1e-30;

/// Geometric prior over the number of inference steps {0, ..., max_steps}.
///
/// Entry k (k < max_steps) is the probability of k successful "continue"
/// decisions followed by a stop: `p^k (1 - p)`. The last entry absorbs the
/// remaining mass `p^max_steps` (never stopping within the step budget).
///
/// * `success_prob` - probability of continuing for one more step
/// * `max_steps` - step budget
pub fn geometric_prior(success_prob: f64, max_steps: usize, device: &Device) -> Result<Tensor> {
    let p = success_prob.clamp(0., 1.);
    let mut mass = Vec::with_capacity(max_steps + 1);
    for k in 0..max_steps {
        mass.push((p.powi(k as i32) * (1. - p)) as f32);
    }
    mass.push(p.powi(max_steps as i32) as f32);
    Tensor::from_vec(mass, max_steps + 1, device)
}

/// Exact KL between two discrete distributions over the same bins.
///
/// Returns the per-bin table `q * (ln q - ln p)` of shape `[n, k]`; callers
/// sum over the bin axis. Logs are clamped so that empty posterior bins
/// contribute zero rather than NaN.
///
/// * `q_nk` - posterior probabilities (n x k)
/// * `p_k` - prior probabilities (k)
pub fn tabular_kl(q_nk: &Tensor, p_k: &Tensor) -> Result<Tensor> {
    let log_q_nk = q_nk.clamp(LOG_EPS, 1.)?.log()?;
    let log_p_k = p_k.clamp(LOG_EPS, 1.)?.log()?;
    q_nk * log_q_nk.broadcast_sub(&log_p_k)?
}

/// Posterior probability that at least t objects exist, for t = 1..=max_steps.
///
/// Reverse cumulative sum over the tail bins of the step-count posterior,
/// returned step-major (`[max_steps, n]`) so it aligns with trajectory
/// tensors. This is the analytic expectation weight for conditional KL terms.
pub fn posterior_tail_weights(prob_nk: &Tensor, max_steps: usize) -> Result<Tensor> {
    let tail_sn = prob_nk.narrow(1, 1, max_steps)?.t()?.contiguous()?;
    let cum_sn = tail_sn.cumsum(0)?;
    let total_1n = tail_sn.sum_keepdim(0)?;
    total_1n.broadcast_sub(&cum_sn)? + tail_sn
}

/// Categorical distribution over the number of steps taken, derived from
/// per-step continuation probabilities by a stick-breaking transform.
///
/// Stopping exactly after k steps requires k "continue" outcomes followed by
/// one "stop"; the final bin absorbs the probability of continuing through
/// the whole budget.
pub struct NumStepsDistribution {
    /// Continuation probabilities (n x max_steps), values in [0, 1].
    prob_ns: Tensor,
}

impl NumStepsDistribution {
    pub fn new(prob_ns: Tensor) -> Self {
        Self { prob_ns }
    }

    pub fn max_steps(&self) -> Result<usize> {
        Ok(self.prob_ns.dims2()?.1)
    }

    /// Probability of each step count, shape (n x max_steps+1).
    ///
    /// Computed in probability space with the exact product form, so each row
    /// sums to one up to floating error.
    pub fn prob(&self) -> Result<Tensor> {
        let (n, s) = self.prob_ns.dims2()?;
        let mut continuing_n1 = Tensor::ones((n, 1), self.prob_ns.dtype(), self.prob_ns.device())?;
        let mut bins = Vec::with_capacity(s + 1);
        for k in 0..s {
            let p_n1 = self.prob_ns.narrow(1, k, 1)?;
            let stop_n1 = p_n1.affine(-1., 1.)?;
            bins.push((&continuing_n1 * stop_n1)?);
            continuing_n1 = (continuing_n1 * p_n1)?;
        }
        bins.push(continuing_n1);
        Tensor::cat(&bins, 1)
    }

    /// Log probability of the realized step counts, shape (n).
    ///
    /// Accumulated in log space rather than via `prob().log()`: with many
    /// steps the probability products underflow before the log is taken.
    ///
    /// * `counts_n` - realized step count per sample, integer-valued
    pub fn log_prob(&self, counts_n: &Tensor) -> Result<Tensor> {
        let (n, s) = self.prob_ns.dims2()?;
        let log_cont_ns = self.prob_ns.clamp(LOG_EPS, 1.)?.log()?;
        let log_stop_ns = self.prob_ns.affine(-1., 1.)?.clamp(LOG_EPS, 1.)?.log()?;

        let mut acc_n1 = Tensor::zeros((n, 1), self.prob_ns.dtype(), self.prob_ns.device())?;
        let mut bins = Vec::with_capacity(s + 1);
        for k in 0..s {
            bins.push((&acc_n1 + log_stop_ns.narrow(1, k, 1)?)?);
            acc_n1 = (acc_n1 + log_cont_ns.narrow(1, k, 1)?)?;
        }
        bins.push(acc_n1);
        let log_table_nk = Tensor::cat(&bins, 1)?;

        let idx_n1 = counts_n.to_dtype(DType::U32)?.unsqueeze(1)?;
        log_table_nk.gather(&idx_n1, 1)?.squeeze(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn geometric_prior_sums_to_one() -> Result<()> {
        let device = Device::Cpu;
        for &p in &[0.01, 0.3, 0.5, 0.9, 0.99] {
            for &s in &[1usize, 3, 7] {
                let prior = geometric_prior(p, s, &device)?;
                assert_eq!(prior.dims(), &[s + 1]);
                let total: f32 = prior.sum_all()?.to_scalar()?;
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn geometric_prior_degenerate_probs() -> Result<()> {
        let device = Device::Cpu;
        let never = geometric_prior(0., 4, &device)?.to_vec1::<f32>()?;
        assert_eq!(never, vec![1., 0., 0., 0., 0.]);

        let always = geometric_prior(1., 4, &device)?.to_vec1::<f32>()?;
        assert_eq!(always, vec![0., 0., 0., 0., 1.]);
        Ok(())
    }

    #[test]
    fn posterior_rows_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let prob_ns = Tensor::rand(0f32, 1f32, (6, 4), &device)?;
        let distrib = NumStepsDistribution::new(prob_ns);
        let prob_nk = distrib.prob()?;
        assert_eq!(prob_nk.dims(), &[6, 5]);
        for total in prob_nk.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn log_prob_matches_log_of_prob() -> Result<()> {
        let device = Device::Cpu;
        let max_steps = 3;
        let prob_ns = Tensor::rand(0.1f32, 0.9f32, (5, max_steps), &device)?;
        let distrib = NumStepsDistribution::new(prob_ns);
        let prob_nk = distrib.prob()?.to_vec2::<f32>()?;

        for k in 0..=max_steps {
            let counts_n = Tensor::full(k as f32, 5, &device)?;
            let log_prob_n = distrib.log_prob(&counts_n)?.to_vec1::<f32>()?;
            for (i, lp) in log_prob_n.iter().enumerate() {
                assert_abs_diff_eq!(*lp, prob_nk[i][k].ln(), epsilon = 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn tail_weights_are_tail_sums() -> Result<()> {
        let device = Device::Cpu;
        // two samples with known posteriors over {0, 1, 2}
        let prob_nk = Tensor::from_vec(vec![0.2f32, 0.3, 0.5, 0.6, 0.3, 0.1], (2, 3), &device)?;
        let weight_sn = posterior_tail_weights(&prob_nk, 2)?.to_vec2::<f32>()?;
        // step 0 weight: P(count >= 1), step 1 weight: P(count >= 2)
        assert_abs_diff_eq!(weight_sn[0][0], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(weight_sn[1][0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(weight_sn[0][1], 0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(weight_sn[1][1], 0.1, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn tabular_kl_zero_for_identical() -> Result<()> {
        let device = Device::Cpu;
        let p_k = geometric_prior(0.7, 3, &device)?;
        let q_nk = p_k.unsqueeze(0)?.broadcast_as((4, 4))?.contiguous()?;
        let kl: f32 = tabular_kl(&q_nk, &p_k)?.sum_all()?.to_scalar()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-6);
        Ok(())
    }
}
