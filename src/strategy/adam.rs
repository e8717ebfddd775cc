//! Adam optimizer for proposal scale adaptation.
//!
//! A single-parameter Adam optimizer working on the logarithm of the
//! proposal scale. It takes the acceptance probability of each proposal and
//! moves the scale so that the acceptance rate approaches its target.

use serde::{Deserialize, Serialize};

/// Settings for Adam scale adaptation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamOptions {
    /// First moment decay rate (default: 0.9)
    pub beta1: f64,
    /// Second moment decay rate (default: 0.999)
    pub beta2: f64,
    /// Small constant for numerical stability (default: 1e-8)
    pub epsilon: f64,
    /// Learning rate (default: 0.05)
    pub learning_rate: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            learning_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    log_scale: f64,
    m: f64,
    v: f64,
    t: u64,
    settings: AdamOptions,
}

impl Adam {
    pub fn new(settings: AdamOptions, initial_scale: f64) -> Self {
        Self {
            log_scale: initial_scale.ln(),
            m: 0.0,
            v: 0.0,
            t: 0,
            settings,
        }
    }

    /// Advance the optimizer by one step.
    ///
    /// Acceptance above the target grows the scale, acceptance below the
    /// target shrinks it.
    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let gradient = accept_stat - target;
        self.t += 1;

        let AdamOptions {
            beta1,
            beta2,
            epsilon,
            learning_rate,
        } = self.settings;
        self.m = beta1 * self.m + (1.0 - beta1) * gradient;
        self.v = beta2 * self.v + (1.0 - beta2) * gradient * gradient;

        let m_hat = self.m / (1.0 - beta1.powi(self.t as i32));
        let v_hat = self.v / (1.0 - beta2.powi(self.t as i32));

        self.log_scale += learning_rate * m_hat / (v_hat.sqrt() + epsilon);
    }

    pub fn current_scale(&self) -> f64 {
        self.log_scale.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_toward_target() {
        let mut adam = Adam::new(AdamOptions::default(), 1.0);
        for _ in 0..10 {
            adam.advance(0.0, 0.234);
        }
        assert!(adam.current_scale() < 1.0);

        let mut adam = Adam::new(AdamOptions::default(), 1.0);
        for _ in 0..10 {
            adam.advance(1.0, 0.234);
        }
        assert!(adam.current_scale() > 1.0);
    }

    #[test]
    fn first_step_has_learning_rate_size() {
        let mut adam = Adam::new(AdamOptions::default(), 1.0);
        adam.advance(1.0, 0.5);
        assert!((adam.current_scale().ln() - 0.05).abs() < 1e-6);
    }
}
