//! Ask/tell sampling and optimization strategies.
//!
//! A strategy is constructed fresh from an initial vector and its score. The
//! driver repeatedly asks it for candidates, evaluates their log-posterior
//! and tells it the scores. Nothing but the reported point and score is
//! persisted, so a strategy may be recreated at any persisted point.

mod adam;
mod evolution;
mod metropolis;

pub use adam::{Adam, AdamOptions};
pub use evolution::{EvolutionSettings, EvolutionStrategy};
pub use metropolis::{Metropolis, MetropolisSettings};

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::StrategyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Persists the current sample of the chain.
    Sampler,
    /// Persists the best point found so far.
    Optimizer,
}

/// The outcome of one ask/tell step.
#[derive(Debug, Clone, PartialEq)]
pub struct Told {
    /// The point to persist for this iteration.
    pub point: Box<[f64]>,
    pub score: f64,
    /// Whether the chain moved to a new point.
    pub accepted: bool,
}

pub trait Strategy: Send {
    /// Propose one or more candidate vectors.
    fn ask(&mut self) -> Vec<Box<[f64]>>;

    /// Report the log-posterior of every candidate of the last `ask`.
    fn tell(&mut self, scores: &[f64]) -> Result<Told, StrategyError>;

    fn kind(&self) -> StrategyKind;
}

/// Settings of the strategy that drives every chain of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Algorithm {
    Metropolis(MetropolisSettings),
    EvolutionStrategy(EvolutionSettings),
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Metropolis(MetropolisSettings::default())
    }
}

impl Algorithm {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Algorithm::Metropolis(_) => StrategyKind::Sampler,
            Algorithm::EvolutionStrategy(_) => StrategyKind::Optimizer,
        }
    }

    pub fn build(
        &self,
        initial: &[f64],
        score: f64,
        rng: ChaCha8Rng,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        Ok(match self {
            Algorithm::Metropolis(settings) => {
                Box::new(Metropolis::new(*settings, initial, score, rng)?)
            }
            Algorithm::EvolutionStrategy(settings) => {
                Box::new(EvolutionStrategy::new(*settings, initial, score, rng)?)
            }
        })
    }
}

/// Scores that are not numbers rank as impossible.
pub(crate) fn sanitize(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}
