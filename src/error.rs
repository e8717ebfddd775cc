use thiserror::Error;

/// Configuration errors found while compiling a parameter graph.
///
/// These are always fatal and are raised before any chain is created.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Node name '{0}' is used more than once in this run")]
    DuplicateName(String),
    #[error("Node '{node}' references unknown name '{name}'")]
    UnresolvedReference { node: String, name: String },
    #[error("Equation nodes form a cycle through '{0}'")]
    Cycle(String),
    #[error("Missing data for node '{node}': {reason}")]
    MissingData { node: String, reason: String },
    #[error("The graph has no observed outputs bound to external data")]
    NoObservedOutputs,
    #[error("Invalid parameter edges on node '{node}': {reason}")]
    InvalidEdges { node: String, reason: String },
    #[error("Invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },
    #[error("Could not parse expression of node '{node}': {message}")]
    Expression { node: String, message: String },
}

/// Failures of the durable store.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store i/o failed")]
    Io(#[from] std::io::Error),
    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("Chain {chain} already holds iteration {last}, refusing to write iteration {iteration}")]
    Rewrite {
        chain: u64,
        iteration: u64,
        last: u64,
    },
    #[error("Unknown run {0}")]
    UnknownRun(u64),
    #[error("Unknown chain {chain} in run {run}")]
    UnknownChain { run: u64, chain: u64 },
    #[error("Stored parameters of chain {chain} do not match the compiled layout: {reason}")]
    LayoutMismatch { chain: u64, reason: String },
}

/// A flat vector whose length differs from the parameter layout.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Vector has {got} elements, the layout has {expected}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub got: usize,
}

/// Errors raised by a sampling or optimization strategy.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Expected {expected} scores, got {got}")]
    ScoreCount { expected: usize, got: usize },
    #[error("tell() called without a pending ask()")]
    NoPendingAsk,
    #[error("Invalid strategy setting: {0}")]
    InvalidSetting(String),
}
