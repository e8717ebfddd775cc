use itertools::Itertools;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{sanitize, Strategy, StrategyKind, Told};
use crate::error::StrategyError;

/// Settings for the (μ/μ, λ) evolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Number of candidates per generation.
    pub lambda: usize,
    /// Number of best candidates recombined into the next mean.
    pub mu: usize,
    pub initial_sigma: f64,
    /// Lower bound of the mutation strength.
    pub min_sigma: f64,
    /// Success rate the mutation strength is steered toward.
    pub target_success: f64,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            lambda: 8,
            mu: 4,
            initial_sigma: 0.3,
            min_sigma: 1e-12,
            target_success: 0.2,
        }
    }
}

/// A population optimizer maximizing the log-posterior.
///
/// Each generation samples `lambda` isotropic mutations of the mean and
/// recombines the `mu` best. The mutation strength grows after generations
/// that improve on the best point and shrinks otherwise.
pub struct EvolutionStrategy {
    settings: EvolutionSettings,
    rng: ChaCha8Rng,
    mean: Box<[f64]>,
    sigma: f64,
    best: Box<[f64]>,
    best_score: f64,
    pending: Vec<Box<[f64]>>,
}

impl EvolutionStrategy {
    pub fn new(
        settings: EvolutionSettings,
        initial: &[f64],
        score: f64,
        rng: ChaCha8Rng,
    ) -> Result<Self, StrategyError> {
        if settings.lambda == 0 || settings.mu == 0 || settings.mu > settings.lambda {
            return Err(StrategyError::InvalidSetting(format!(
                "need 0 < mu <= lambda, got mu={} and lambda={}",
                settings.mu, settings.lambda
            )));
        }
        if !(settings.initial_sigma > 0.0) {
            return Err(StrategyError::InvalidSetting(format!(
                "initial_sigma must be positive, got {}",
                settings.initial_sigma
            )));
        }
        Ok(Self {
            settings,
            rng,
            mean: initial.into(),
            sigma: settings.initial_sigma,
            best: initial.into(),
            best_score: sanitize(score),
            pending: Vec::new(),
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl Strategy for EvolutionStrategy {
    fn ask(&mut self) -> Vec<Box<[f64]>> {
        let sigma = self.sigma;
        self.pending = (0..self.settings.lambda)
            .map(|_| {
                self.mean
                    .iter()
                    .map(|x| {
                        let z: f64 = self.rng.sample(StandardNormal);
                        x + sigma * z
                    })
                    .collect()
            })
            .collect();
        self.pending.clone()
    }

    fn tell(&mut self, scores: &[f64]) -> Result<Told, StrategyError> {
        if self.pending.is_empty() {
            return Err(StrategyError::NoPendingAsk);
        }
        if scores.len() != self.pending.len() {
            return Err(StrategyError::ScoreCount {
                expected: self.pending.len(),
                got: scores.len(),
            });
        }
        let candidates = std::mem::take(&mut self.pending);
        let ranked: Vec<usize> = (0..candidates.len())
            .sorted_by(|&a, &b| sanitize(scores[b]).total_cmp(&sanitize(scores[a])))
            .collect();

        let dim = self.mean.len();
        let mu = self.settings.mu;
        let mut mean = vec![0f64; dim];
        for &i in ranked.iter().take(mu) {
            for (m, x) in mean.iter_mut().zip(candidates[i].iter()) {
                *m += x / mu as f64;
            }
        }
        self.mean = mean.into();

        let top = ranked[0];
        let improved = sanitize(scores[top]) > self.best_score;
        if improved {
            self.best = candidates[top].clone();
            self.best_score = sanitize(scores[top]);
        }

        let success = if improved { 1.0 } else { 0.0 };
        let damping = 1.0 + dim as f64 / 2.0;
        self.sigma = (self.sigma * ((success - self.settings.target_success) / damping).exp())
            .max(self.settings.min_sigma);

        Ok(Told {
            point: self.best.clone(),
            score: self.best_score,
            accepted: improved,
        })
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Optimizer
    }
}
