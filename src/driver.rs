//! The execution driver: compile, initialize, iterate, persist, resume.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::{
    chain::{chain_rng, IterationProgress, StrategyChain},
    compiler::{compile, CompiledRun},
    covariate::CovariateSource,
    graph::ParameterGraph,
    likelihood::LogPosterior,
    model::ForwardModel,
    persistence::Persistence,
    run::{RunCounters, RunRecord, RunSettings, RunState},
    storage::RunStore,
    tasks::{CancelToken, TaskId},
};

pub type ProgressCallback = Box<dyn FnMut(&IterationProgress) + Send>;

/// Drives the chains of one inference run.
///
/// All progress lives in the store: a driver can be dropped at any point and
/// a new one for the same run continues from the last persisted iteration of
/// every chain.
pub struct Inference {
    id: u64,
    graph: ParameterGraph,
    model: Arc<dyn ForwardModel>,
    covariates: Arc<dyn CovariateSource>,
    store: Arc<dyn RunStore>,
    callback: Option<ProgressCallback>,
}

impl Inference {
    /// Create a new run record with `settings`, replacing any run with the
    /// same id.
    pub fn create(
        id: u64,
        graph: ParameterGraph,
        model: Arc<dyn ForwardModel>,
        covariates: Arc<dyn CovariateSource>,
        store: Arc<dyn RunStore>,
        settings: RunSettings,
    ) -> Result<Self> {
        if store.load_run(id).is_ok() {
            store
                .delete_run(id)
                .with_context(|| format!("Could not replace run {}", id))?;
        }
        store
            .save_run(&RunRecord::new(id, settings))
            .with_context(|| format!("Could not create run {}", id))?;
        Ok(Self {
            id,
            graph,
            model,
            covariates,
            store,
            callback: None,
        })
    }

    /// Attach to an existing run.
    pub fn open(
        id: u64,
        graph: ParameterGraph,
        model: Arc<dyn ForwardModel>,
        covariates: Arc<dyn CovariateSource>,
        store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        store
            .load_run(id)
            .with_context(|| format!("Could not open run {}", id))?;
        Ok(Self {
            id,
            graph,
            model,
            covariates,
            store,
            callback: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Call `callback` after every persisted chain iteration.
    pub fn on_progress(&mut self, callback: impl FnMut(&IterationProgress) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    pub fn record(&self) -> Result<RunRecord> {
        self.store
            .load_run(self.id)
            .with_context(|| format!("Could not load run {}", self.id))
    }

    /// Change the settings of the run, e.g. to extend the iteration budget
    /// of a completed run before resuming it.
    ///
    /// The chain count of a run with chains can only change through
    /// [`Self::reset`].
    pub fn update_settings(&self, update: impl FnOnce(&mut RunSettings)) -> Result<()> {
        let mut record = self.record()?;
        let num_chains = record.settings.num_chains;
        update(&mut record.settings);
        if record.settings.num_chains != num_chains && !self.chain_ids()?.is_empty() {
            bail!(
                "Run {} has chains, reset it before changing the chain count from {} to {}",
                self.id,
                num_chains,
                record.settings.num_chains
            );
        }
        self.save(&record)
    }

    fn save(&self, record: &RunRecord) -> Result<()> {
        self.store
            .save_run(record)
            .with_context(|| format!("Could not persist run {}", self.id))
    }

    fn persistence(&self) -> Persistence {
        Persistence::new(self.store.clone(), self.id)
    }

    fn chain_ids(&self) -> Result<Vec<u64>> {
        self.store
            .chains(self.id)
            .with_context(|| format!("Could not list chains of run {}", self.id))
    }

    /// Whether every chain `0..num_chains` exists and holds iteration 0.
    ///
    /// An initialization interrupted by a crash or a store failure leaves
    /// missing or empty chains behind.
    fn is_initialized(&self, record: &RunRecord) -> Result<bool> {
        let chains = self.chain_ids()?;
        if chains.is_empty() || chains != (0..record.settings.num_chains).collect::<Vec<_>>() {
            return Ok(false);
        }
        for chain in chains {
            let last = self
                .store
                .last_iteration(self.id, chain)
                .with_context(|| format!("Could not read the progress of chain {}", chain))?;
            if last.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Move the run to Failed, keeping everything persisted so far.
    fn record_failure(&self, record: &mut RunRecord, err: &anyhow::Error) {
        error!("Run {} failed: {:#}", self.id, err);
        record.state = RunState::Failed;
        record.task = None;
        record.error = Some(format!("{:#}", err));
        if let Err(save_err) = self.save(record) {
            error!("Run {}: could not record the failure: {:#}", self.id, save_err);
        }
    }

    /// Compile the graph of this run.
    pub fn compile(&self) -> Result<CompiledRun> {
        compile(&self.graph, self.model.as_ref(), self.covariates.as_ref())
            .with_context(|| format!("Could not compile run {}", self.id))
    }

    /// Compile, replace all chains by fresh ones and persist iteration 0 of
    /// every chain at the initial vector.
    ///
    /// Compile errors leave the run untouched. Any later error marks it
    /// Failed; the next [`Self::run`] initializes it again.
    pub fn initialize(&mut self) -> Result<Arc<CompiledRun>> {
        let compiled = Arc::new(self.compile()?);
        let mut record = self.record()?;
        if let Err(err) = self.initialize_chains(&compiled, &mut record) {
            self.record_failure(&mut record, &err);
            return Err(err);
        }
        Ok(compiled)
    }

    fn initialize_chains(&self, compiled: &Arc<CompiledRun>, record: &mut RunRecord) -> Result<()> {
        if record.settings.num_chains == 0 {
            bail!("Run {} needs at least one chain", self.id);
        }

        let posterior = LogPosterior::new(compiled.clone(), self.model.clone());
        let logp = posterior
            .logp(&compiled.initial)
            .context("Could not evaluate the initial log-posterior")?;
        if !logp.is_finite() {
            warn!(
                "Run {}: initial log-posterior is {}, chains start at an impossible point",
                self.id, logp
            );
        }

        self.store
            .delete_chains(self.id)
            .context("Could not delete stale chains")?;
        let persistence = self.persistence();
        for chain in 0..record.settings.num_chains {
            self.store
                .create_chain(self.id, chain)
                .with_context(|| format!("Could not create chain {}", chain))?;
            persistence
                .write_snapshot(&compiled.index, chain, 0, &compiled.initial, logp)
                .with_context(|| format!("Could not persist iteration 0 of chain {}", chain))?;
        }

        record.state = RunState::Compiled;
        record.counters = RunCounters {
            function_evaluations: 1,
            ..Default::default()
        };
        record.error = None;
        self.save(record)?;
        info!(
            "Initialized run {} with {} chains over {} free parameters",
            self.id,
            record.settings.num_chains,
            compiled.dim()
        );
        Ok(())
    }

    /// Run until the iteration budget is exhausted or `cancel` is set.
    ///
    /// Runs without a complete set of chains are initialized first,
    /// otherwise every chain continues from its last persisted iteration.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunState> {
        self.execute(None, cancel)
    }

    pub(crate) fn run_task(&mut self, task: TaskId, cancel: &CancelToken) -> Result<RunState> {
        self.execute(Some(task), cancel)
    }

    fn execute(&mut self, task: Option<TaskId>, cancel: &CancelToken) -> Result<RunState> {
        let compiled = Arc::new(self.compile()?);
        let mut record = self.record()?;

        match self.drive(&compiled, &mut record, task, cancel) {
            Ok(state) => {
                record.state = state;
                record.task = None;
                self.save(&record)?;
                info!(
                    "Run {} {:?} after {} iterations and {} evaluations",
                    self.id, state, record.counters.iterations, record.counters.function_evaluations
                );
                Ok(state)
            }
            Err(err) => {
                self.record_failure(&mut record, &err);
                Err(err)
            }
        }
    }

    fn drive(
        &mut self,
        compiled: &Arc<CompiledRun>,
        record: &mut RunRecord,
        task: Option<TaskId>,
        cancel: &CancelToken,
    ) -> Result<RunState> {
        if !self.is_initialized(record)? {
            self.initialize_chains(compiled, record)?;
        }

        let persistence = self.persistence();
        let posterior = LogPosterior::new(compiled.clone(), self.model.clone());
        let mut chains = Vec::new();
        for chain in self.chain_ids()? {
            let point = persistence
                .resume_point(&compiled.index, chain)
                .with_context(|| format!("Could not read the resume point of chain {}", chain))?
                .with_context(|| format!("Chain {} has no persisted iterations", chain))?;
            let rng = chain_rng(record.settings.seed, chain, point.iteration);
            let strategy = record
                .settings
                .algorithm
                .build(&point.position, point.log_posterior, rng)
                .with_context(|| format!("Could not create the strategy of chain {}", chain))?;
            chains.push(StrategyChain::new(
                chain,
                point.iteration,
                strategy,
                posterior.clone(),
            ));
        }

        let start = chains.iter().map(|c| c.iteration()).min().unwrap_or(0);
        info!(
            "Run {}: starting at iteration {} of {} with {} chains",
            self.id,
            start,
            record.settings.max_iterations,
            chains.len()
        );
        record.state = RunState::Running;
        record.task = task;
        record.error = None;
        self.save(record)?;

        self.iterate(&mut chains, record, &persistence, compiled, cancel)
    }

    fn iterate(
        &mut self,
        chains: &mut [StrategyChain],
        record: &mut RunRecord,
        persistence: &Persistence,
        compiled: &CompiledRun,
        cancel: &CancelToken,
    ) -> Result<RunState> {
        let max = record.settings.max_iterations;
        let started = Instant::now();
        let elapsed_before: Duration = record.counters.elapsed;

        loop {
            if chains.iter().all(|c| c.iteration() >= max) {
                return Ok(RunState::Completed);
            }
            if cancel.is_cancelled() {
                info!("Run {} stopped at iteration {}", self.id, record.counters.iterations);
                return Ok(RunState::Stopped);
            }

            for chain in chains.iter_mut().filter(|c| c.iteration() < max) {
                let (told, evaluations) = chain.draw()?;
                persistence
                    .write_snapshot(
                        &compiled.index,
                        chain.id(),
                        chain.iteration(),
                        &told.point,
                        told.score,
                    )
                    .with_context(|| {
                        format!(
                            "Could not persist iteration {} of chain {}",
                            chain.iteration(),
                            chain.id()
                        )
                    })?;
                record.counters.function_evaluations += evaluations;
                debug!(
                    "Run {} chain {} iteration {}: logp {}",
                    self.id,
                    chain.id(),
                    chain.iteration(),
                    told.score
                );

                if let Some(callback) = &mut self.callback {
                    callback(&IterationProgress {
                        run: self.id,
                        chain: chain.id(),
                        iteration: chain.iteration(),
                        log_posterior: told.score,
                        accepted: told.accepted,
                        acceptance_rate: chain.acceptance_rate(),
                        function_evaluations: record.counters.function_evaluations,
                        elapsed: elapsed_before + started.elapsed(),
                    });
                }
            }

            record.counters.iterations = chains.iter().map(|c| c.iteration()).min().unwrap_or(0);
            record.counters.elapsed = elapsed_before + started.elapsed();
            self.save(record)?;
        }
    }

    /// Delete all chains and counters, keeping the graph and the settings.
    pub fn reset(&self) -> Result<()> {
        self.store
            .delete_chains(self.id)
            .with_context(|| format!("Could not delete the chains of run {}", self.id))?;
        let mut record = self.record()?;
        record.state = RunState::Uninitialized;
        record.counters = RunCounters::default();
        record.task = None;
        record.error = None;
        self.save(&record)?;
        info!("Reset run {}", self.id);
        Ok(())
    }

    /// Delete the run together with its chains and results.
    pub fn delete(self) -> Result<()> {
        self.store
            .delete_run(self.id)
            .with_context(|| format!("Could not delete run {}", self.id))?;
        info!("Deleted run {}", self.id);
        Ok(())
    }
}
