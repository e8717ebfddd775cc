use crate::{error::StoreError, layout::SlotKey, run::RunRecord};

/// Everything persisted for one chain iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub chain: u64,
    pub iteration: u64,
    pub log_posterior: f64,
    /// The persisted point, labelled by slot, in vector order.
    pub parameters: Vec<(SlotKey, f64)>,
}

/// The log-posterior of a chain at one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionResult {
    pub chain: u64,
    pub iteration: u64,
    pub value: f64,
}

/// One element of a free parameter of a chain at one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterResult {
    pub chain: u64,
    pub iteration: u64,
    pub node: String,
    pub index: usize,
    pub value: f64,
}

impl IterationRecord {
    pub fn function_result(&self) -> FunctionResult {
        FunctionResult {
            chain: self.chain,
            iteration: self.iteration,
            value: self.log_posterior,
        }
    }

    pub fn parameter_results(&self) -> impl Iterator<Item = ParameterResult> + '_ {
        self.parameters.iter().map(|(slot, value)| ParameterResult {
            chain: self.chain,
            iteration: self.iteration,
            node: slot.name.clone(),
            index: slot.element,
            value: *value,
        })
    }
}

/// The durable store of runs, chains and iteration records.
///
/// Iteration records are append-only: a chain accepts an iteration only if
/// its index is larger than every index already stored for that chain.
/// Deleting a run removes its chains and their records.
pub trait RunStore: Send + Sync {
    /// Create or overwrite a run record.
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    fn load_run(&self, run: u64) -> Result<RunRecord, StoreError>;

    fn delete_run(&self, run: u64) -> Result<(), StoreError>;

    /// Create an empty chain. Creating an existing chain is a no-op.
    fn create_chain(&self, run: u64, chain: u64) -> Result<(), StoreError>;

    /// Chain ids of a run in ascending order.
    fn chains(&self, run: u64) -> Result<Vec<u64>, StoreError>;

    /// Delete every chain of a run together with its records.
    fn delete_chains(&self, run: u64) -> Result<(), StoreError>;

    fn append_iteration(&self, run: u64, record: &IterationRecord) -> Result<(), StoreError>;

    /// Function results of a chain ordered by iteration.
    fn function_results(&self, run: u64, chain: u64) -> Result<Vec<FunctionResult>, StoreError>;

    /// Parameter results of a chain ordered by iteration, then vector order.
    fn parameter_results(&self, run: u64, chain: u64) -> Result<Vec<ParameterResult>, StoreError>;

    fn last_iteration(&self, run: u64, chain: u64) -> Result<Option<u64>, StoreError>;
}

pub(crate) fn check_append(
    chain: u64,
    iteration: u64,
    last: Option<u64>,
) -> Result<(), StoreError> {
    match last {
        Some(last) if iteration <= last => Err(StoreError::Rewrite {
            chain,
            iteration,
            last,
        }),
        _ => Ok(()),
    }
}
