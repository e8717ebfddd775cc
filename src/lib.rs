//! Graph-compiled inference runs for pharmacometric models.
//!
//! A [`ParameterGraph`] declares fixed values, priors, equations, population
//! distributions and observed outputs of a forward model. The compiler turns
//! it into a flat free-parameter vector and a [`LogPosterior`] over that
//! vector. The [`Inference`] driver runs independent chains of an ask/tell
//! [`Strategy`] against the posterior and persists every iteration in a
//! [`RunStore`], so runs can be stopped, resumed and inspected at any time.
//!
//! ```
//! use std::sync::Arc;
//!
//! use pmx_infer::{
//!     CancelToken, DistributionKind, ForwardModel, InMemoryCovariates, Inference,
//!     LikelihoodNode, MemoryStore, ParameterGraph, Prior, RunSettings, RunState, Series,
//!     SimulationError, Trace,
//! };
//!
//! struct Decay;
//!
//! impl ForwardModel for Decay {
//!     fn parameter_names(&self) -> Vec<String> {
//!         vec!["k".into()]
//!     }
//!
//!     fn default_parameters(&self) -> Vec<f64> {
//!         vec![1.0]
//!     }
//!
//!     fn outputs(&self) -> Vec<String> {
//!         vec!["y".into()]
//!     }
//!
//!     fn simulate(
//!         &self,
//!         parameters: &[f64],
//!         _outputs: &[&str],
//!         times: &[f64],
//!     ) -> Result<Vec<Vec<f64>>, SimulationError> {
//!         Ok(vec![times.iter().map(|t| (-parameters[0] * t).exp()).collect()])
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut graph = ParameterGraph::new();
//! let obs = graph.add_node(
//!     LikelihoodNode::distribution("y", DistributionKind::Normal).with_covariate("y_data"),
//! );
//! let model = graph.add_node(LikelihoodNode::model("decay"));
//! let k = graph.add_node(LikelihoodNode::fixed("k", 0.5).with_prior(Prior::log_normal(0.0, 1.0)));
//! let sigma = graph.add_node(LikelihoodNode::fixed("sigma", 0.1));
//! graph.connect(obs, model, 0)?;
//! graph.connect(obs, sigma, 1)?;
//! graph.connect(model, k, 0)?;
//!
//! let data = InMemoryCovariates::new().with(
//!     "y_data",
//!     Series::pooled(vec![0.5, 1.0, 2.0], vec![0.78, 0.61, 0.37]),
//! );
//! let settings = RunSettings {
//!     num_chains: 2,
//!     max_iterations: 50,
//!     ..Default::default()
//! };
//! let store = MemoryStore::new();
//! let mut inference = Inference::create(
//!     1,
//!     graph,
//!     Arc::new(Decay),
//!     Arc::new(data),
//!     Arc::new(store.clone()),
//!     settings,
//! )?;
//! assert_eq!(inference.run(&CancelToken::new())?, RunState::Completed);
//!
//! let trace = Trace::load(&store, 1)?;
//! assert_eq!(trace.chains[0].len(), 51);
//! assert!(trace.best().is_some());
//! # Ok(())
//! # }
//! ```

pub(crate) mod chain;
pub(crate) mod compiler;
pub(crate) mod covariate;
pub(crate) mod distribution;
pub(crate) mod driver;
pub(crate) mod error;
pub(crate) mod expr;
pub(crate) mod graph;
pub(crate) mod layout;
pub(crate) mod likelihood;
pub(crate) mod model;
pub(crate) mod persistence;
pub(crate) mod run;
pub(crate) mod storage;
pub(crate) mod strategy;
pub(crate) mod tasks;
pub(crate) mod trace;

pub use chain::IterationProgress;
pub use compiler::{compile, CompiledRun, ObservedOutput};
pub use covariate::{CovariateSource, InMemoryCovariates, Series, SubjectSeries};
pub use distribution::{log_density, log_likelihood, typical_value};
pub use driver::{Inference, ProgressCallback};
pub use error::{CompileError, DimensionMismatch, StoreError, StrategyError};
pub use expr::{CompiledExpr, ExprError};
pub use graph::{
    DistributionKind, LikelihoodNode, NodeForm, NodeId, ParameterEdge, ParameterGraph, Pooling,
    Prior,
};
pub use layout::{Density, FreeParameter, Operand, ParameterIndex, SlotKey};
pub use likelihood::{log_prior, CombinedLogLikelihood, LogPosterior, OutputLikelihood};
pub use model::{ForwardModel, LogpError, SimulationError};
pub use persistence::{Persistence, ResumePoint};
pub use run::{RunCounters, RunRecord, RunSettings, RunState};
pub use storage::{
    CsvStore, FunctionResult, IterationRecord, MemoryStore, ParameterResult, RunStore,
};
pub use strategy::{
    Adam, AdamOptions, Algorithm, EvolutionSettings, EvolutionStrategy, Metropolis,
    MetropolisSettings, Strategy, StrategyKind, Told,
};
pub use tasks::{spawn_run, CancelToken, InlineQueue, Job, TaskHandle, TaskId, TaskQueue, ThreadPoolQueue};
pub use trace::{BestPoint, ChainTrace, Trace};
