use std::str::FromStr;

use crate::error::AirError;

/// Annealing curve for a scalar hyper-parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnealKind {
    Exponential,
    Linear,
}

impl FromStr for AnnealKind {
    type Err = AirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exp" | "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(AirError::UnsupportedSchedule(other.to_string())),
        }
    }
}

/// Time-varying scalar that decays from `init` towards `final_value`.
///
/// All arithmetic is done in `f64`; with large step counts and extreme
/// `init/final_value` ratios the exponential decay rate underflows in `f32`.
///
/// * `init` - starting value
/// * `final_value` - floor value, reached at `steps`
/// * `kind` - decay curve
/// * `step` - global step counter
/// * `steps` - number of steps over which to anneal
/// * `hold_for` - number of initial steps during which the value is held at `init`
/// * `steps_div` - staircase divisor for the exponential curve
pub fn anneal_weight(
    init: f64,
    final_value: f64,
    kind: AnnealKind,
    step: f64,
    steps: f64,
    hold_for: f64,
    steps_div: f64,
) -> f64 {
    let step = (step - hold_for).max(0.);

    let value = match kind {
        AnnealKind::Exponential => {
            let decay_rate = (final_value / init).powf(steps_div / steps);
            init * decay_rate.powf(step / steps_div)
        }
        AnnealKind::Linear => final_value + (init - final_value) * (1. - step / steps),
    };

    value.max(final_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_endpoints_and_clamp() {
        let at = |step: f64| anneal_weight(1.0, 0.0, AnnealKind::Linear, step, 100., 0., 1.);
        assert_abs_diff_eq!(at(0.), 1.0);
        assert_abs_diff_eq!(at(50.), 0.5);
        assert_abs_diff_eq!(at(100.), 0.0);
        // never decays below the floor
        assert_abs_diff_eq!(at(200.), 0.0);
    }

    #[test]
    fn exponential_reaches_final() {
        let init = 0.9999999;
        let final_value = 0.00001;
        let steps = 1e5;
        let val = anneal_weight(
            init,
            final_value,
            AnnealKind::Exponential,
            steps,
            steps,
            0.,
            steps,
        );
        assert_abs_diff_eq!(val, final_value, epsilon = 1e-9);
    }

    #[test]
    fn hold_for_delays_decay() {
        let held = anneal_weight(1.0, 0.1, AnnealKind::Linear, 10., 100., 10., 1.);
        assert_abs_diff_eq!(held, 1.0);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("exp".parse::<AnnealKind>().is_ok());
        assert!("linear".parse::<AnnealKind>().is_ok());
        assert!("cosine".parse::<AnnealKind>().is_err());
    }
}
