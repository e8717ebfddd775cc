use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    likelihood::LogPosterior,
    model::{LogpError, SimulationError},
    strategy::{Strategy, Told},
};

/// Progress of one chain after a persisted iteration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct IterationProgress {
    pub run: u64,
    pub chain: u64,
    pub iteration: u64,
    pub log_posterior: f64,
    pub accepted: bool,
    /// Fraction of accepted steps since the chain was (re)started.
    pub acceptance_rate: f64,
    /// Log-posterior evaluations of the whole run so far.
    pub function_evaluations: u64,
    pub elapsed: Duration,
}

/// The random number generator of `chain` for a segment starting at
/// iteration `start`.
pub(crate) fn chain_rng(seed: u64, chain: u64, start: u64) -> ChaCha8Rng {
    let mut rng =
        ChaCha8Rng::seed_from_u64(seed.wrapping_add(start.wrapping_mul(0x9E37_79B9_7F4A_7C15)));
    rng.set_stream(chain);
    rng
}

/// One chain: a private strategy instance asking and telling against the
/// shared log-posterior.
pub(crate) struct StrategyChain {
    chain: u64,
    iteration: u64,
    strategy: Box<dyn Strategy>,
    posterior: LogPosterior,
    steps: u64,
    accepted: u64,
    warned: bool,
}

impl StrategyChain {
    pub(crate) fn new(
        chain: u64,
        iteration: u64,
        strategy: Box<dyn Strategy>,
        posterior: LogPosterior,
    ) -> Self {
        Self {
            chain,
            iteration,
            strategy,
            posterior,
            steps: 0,
            accepted: 0,
            warned: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.chain
    }

    /// The last iteration this chain produced.
    pub(crate) fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.accepted as f64 / self.steps as f64
        }
    }

    fn score(&mut self, position: &[f64]) -> Result<f64, SimulationError> {
        match self.posterior.try_logp(position) {
            Err(err) if err.is_recoverable() => {
                if !self.warned {
                    warn!(
                        "Chain {}: rejecting candidate after simulation failure: {}",
                        self.chain, err
                    );
                    self.warned = true;
                } else {
                    debug!("Chain {}: simulation failure: {}", self.chain, err);
                }
                Ok(f64::NEG_INFINITY)
            }
            other => other,
        }
    }

    /// Advance by one iteration, returning the point to persist and the
    /// number of log-posterior evaluations it took.
    pub(crate) fn draw(&mut self) -> Result<(Told, u64)> {
        let candidates = self.strategy.ask();
        let scores = candidates
            .iter()
            .map(|candidate| self.score(candidate))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Chain {} failed to evaluate the log-posterior", self.chain))?;
        let told = self
            .strategy
            .tell(&scores)
            .with_context(|| format!("Chain {} strategy failed", self.chain))?;

        self.iteration += 1;
        self.steps += 1;
        if told.accepted {
            self.accepted += 1;
        }
        Ok((told, scores.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        compiler::compile,
        likelihood::test_graphs::pooled_clearance,
        model::test_models::OneCompartment,
        strategy::{Algorithm, EvolutionSettings, StrategyKind},
    };
    use rand::Rng;

    fn posterior() -> LogPosterior {
        let (graph, covariates) = pooled_clearance();
        let model = OneCompartment::default();
        let run = compile(&graph, &model, &covariates).unwrap();
        LogPosterior::new(Arc::new(run), Arc::new(model))
    }

    #[test]
    fn rng_streams_differ_per_chain_and_segment() {
        let a: u64 = chain_rng(1, 0, 0).random();
        let b: u64 = chain_rng(1, 1, 0).random();
        let c: u64 = chain_rng(1, 0, 5).random();
        let again: u64 = chain_rng(1, 0, 5).random();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(c, again);
    }

    #[test]
    fn optimizer_chain_counts_population_evaluations() {
        let posterior = posterior();
        let init = posterior.compiled().initial.clone();
        let score = posterior.logp(&init).unwrap();
        let algorithm = Algorithm::EvolutionStrategy(EvolutionSettings::default());
        let strategy = algorithm.build(&init, score, chain_rng(0, 0, 0)).unwrap();
        assert_eq!(strategy.kind(), StrategyKind::Optimizer);

        let mut chain = StrategyChain::new(0, 0, strategy, posterior);
        let mut best = score;
        for i in 1..=20 {
            let (told, evaluations) = chain.draw().unwrap();
            assert_eq!(evaluations, 8);
            assert_eq!(chain.iteration(), i);
            assert!(told.score >= best);
            best = told.score;
        }
    }
}
