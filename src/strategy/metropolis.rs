use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{sanitize, Adam, AdamOptions, Strategy, StrategyKind, Told};
use crate::error::StrategyError;

/// Settings for adaptive random-walk Metropolis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetropolisSettings {
    /// Standard deviation of the initial isotropic proposal.
    pub initial_scale: f64,
    /// Acceptance rate the proposal scale is adapted toward.
    pub target_accept: f64,
    /// Number of steps during which the proposal scale is adapted.
    pub num_adapt: u64,
    pub adam: AdamOptions,
}

impl Default for MetropolisSettings {
    fn default() -> Self {
        Self {
            initial_scale: 0.1,
            target_accept: 0.234,
            num_adapt: 500,
            adam: AdamOptions::default(),
        }
    }
}

/// Random-walk Metropolis with an adapted isotropic Gaussian proposal.
pub struct Metropolis {
    settings: MetropolisSettings,
    rng: ChaCha8Rng,
    current: Box<[f64]>,
    current_score: f64,
    pending: Option<Box<[f64]>>,
    adam: Adam,
    step: u64,
}

impl Metropolis {
    pub fn new(
        settings: MetropolisSettings,
        initial: &[f64],
        score: f64,
        rng: ChaCha8Rng,
    ) -> Result<Self, StrategyError> {
        if !(settings.initial_scale > 0.0) {
            return Err(StrategyError::InvalidSetting(format!(
                "initial_scale must be positive, got {}",
                settings.initial_scale
            )));
        }
        if !(settings.target_accept > 0.0 && settings.target_accept < 1.0) {
            return Err(StrategyError::InvalidSetting(format!(
                "target_accept must lie in (0, 1), got {}",
                settings.target_accept
            )));
        }
        Ok(Self {
            settings,
            rng,
            current: initial.into(),
            current_score: sanitize(score),
            pending: None,
            adam: Adam::new(settings.adam, settings.initial_scale),
            step: 0,
        })
    }

    pub fn scale(&self) -> f64 {
        self.adam.current_scale()
    }
}

impl Strategy for Metropolis {
    fn ask(&mut self) -> Vec<Box<[f64]>> {
        let scale = self.scale();
        let proposal: Box<[f64]> = self
            .current
            .iter()
            .map(|x| {
                let z: f64 = self.rng.sample(StandardNormal);
                x + scale * z
            })
            .collect();
        self.pending = Some(proposal.clone());
        vec![proposal]
    }

    fn tell(&mut self, scores: &[f64]) -> Result<Told, StrategyError> {
        if scores.len() != 1 {
            return Err(StrategyError::ScoreCount {
                expected: 1,
                got: scores.len(),
            });
        }
        let proposal = self.pending.take().ok_or(StrategyError::NoPendingAsk)?;
        let score = sanitize(scores[0]);

        let log_alpha = if score == f64::NEG_INFINITY {
            f64::NEG_INFINITY
        } else if self.current_score == f64::NEG_INFINITY {
            0.0
        } else {
            (score - self.current_score).min(0.0)
        };
        let accepted = log_alpha == 0.0 || self.rng.random::<f64>().ln() < log_alpha;

        if self.step < self.settings.num_adapt {
            self.adam.advance(log_alpha.exp(), self.settings.target_accept);
        }
        self.step += 1;

        if accepted {
            self.current = proposal;
            self.current_score = score;
        }
        Ok(Told {
            point: self.current.clone(),
            score: self.current_score,
            accepted,
        })
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Sampler
    }
}
