//! Densities of the distributional node forms.
//!
//! The same three kinds serve as priors, population distributions and
//! observation-noise models. Normalizing constants are included so that
//! log-posteriors of different layouts stay comparable.

use crate::graph::DistributionKind;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

fn normal_logpdf(x: f64, mean: f64, sd: f64) -> f64 {
    if !(sd > 0.0) {
        return f64::NEG_INFINITY;
    }
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LN_SQRT_2PI
}

/// Log-density of `x` under `kind` with arguments `(a, b)`.
///
/// Invalid arguments or `x` outside the support give negative infinity.
pub fn log_density(kind: DistributionKind, x: f64, a: f64, b: f64) -> f64 {
    match kind {
        DistributionKind::Normal => normal_logpdf(x, a, b),
        DistributionKind::LogNormal => {
            if !(x > 0.0) {
                return f64::NEG_INFINITY;
            }
            normal_logpdf(x.ln(), a, b) - x.ln()
        }
        DistributionKind::Uniform => {
            if !(b > a) || x < a || x > b {
                f64::NEG_INFINITY
            } else {
                -(b - a).ln()
            }
        }
    }
}

/// Log-likelihood of one observation given the simulated value.
///
/// `scale` is the standard deviation for `Normal`, the standard deviation on
/// the log scale for `LogNormal` and the half-width for `Uniform`.
pub fn log_likelihood(kind: DistributionKind, observed: f64, predicted: f64, scale: f64) -> f64 {
    if !predicted.is_finite() {
        return f64::NEG_INFINITY;
    }
    match kind {
        DistributionKind::Normal => normal_logpdf(observed, predicted, scale),
        DistributionKind::LogNormal => {
            if !(predicted > 0.0) {
                return f64::NEG_INFINITY;
            }
            log_density(kind, observed, predicted.ln(), scale)
        }
        DistributionKind::Uniform => {
            log_density(kind, observed, predicted - scale, predicted + scale)
        }
    }
}

/// A representative value used to seed chains.
pub fn typical_value(kind: DistributionKind, a: f64, b: f64) -> f64 {
    match kind {
        DistributionKind::Normal => a,
        DistributionKind::LogNormal => a.exp(),
        DistributionKind::Uniform => 0.5 * (a + b),
    }
}
