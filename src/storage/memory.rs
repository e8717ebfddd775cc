use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::core::{check_append, FunctionResult, IterationRecord, ParameterResult, RunStore};
use crate::{error::StoreError, run::RunRecord};

struct RunEntry {
    record: RunRecord,
    chains: BTreeMap<u64, Vec<IterationRecord>>,
}

/// An in-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    runs: Arc<Mutex<HashMap<u64, RunEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chains over all runs.
    pub fn total_chains(&self) -> usize {
        let runs = self.runs.lock().expect("Poisoned lock");
        runs.values().map(|run| run.chains.len()).sum()
    }

    /// Number of function results over all runs and chains.
    pub fn total_function_results(&self) -> usize {
        let runs = self.runs.lock().expect("Poisoned lock");
        runs.values()
            .flat_map(|run| run.chains.values())
            .map(|records| records.len())
            .sum()
    }

    fn with_chain<T>(
        &self,
        run: u64,
        chain: u64,
        func: impl FnOnce(&mut Vec<IterationRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut runs = self.runs.lock().expect("Poisoned lock");
        let entry = runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        let records = entry
            .chains
            .get_mut(&chain)
            .ok_or(StoreError::UnknownChain { run, chain })?;
        func(records)
    }
}

impl RunStore for MemoryStore {
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("Poisoned lock");
        runs.entry(run.id)
            .and_modify(|entry| entry.record = run.clone())
            .or_insert_with(|| RunEntry {
                record: run.clone(),
                chains: BTreeMap::new(),
            });
        Ok(())
    }

    fn load_run(&self, run: u64) -> Result<RunRecord, StoreError> {
        let runs = self.runs.lock().expect("Poisoned lock");
        runs.get(&run)
            .map(|entry| entry.record.clone())
            .ok_or(StoreError::UnknownRun(run))
    }

    fn delete_run(&self, run: u64) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("Poisoned lock");
        runs.remove(&run).map(|_| ()).ok_or(StoreError::UnknownRun(run))
    }

    fn create_chain(&self, run: u64, chain: u64) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("Poisoned lock");
        let entry = runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        entry.chains.entry(chain).or_default();
        Ok(())
    }

    fn chains(&self, run: u64) -> Result<Vec<u64>, StoreError> {
        let runs = self.runs.lock().expect("Poisoned lock");
        let entry = runs.get(&run).ok_or(StoreError::UnknownRun(run))?;
        Ok(entry.chains.keys().copied().collect())
    }

    fn delete_chains(&self, run: u64) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("Poisoned lock");
        let entry = runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        entry.chains.clear();
        Ok(())
    }

    fn append_iteration(&self, run: u64, record: &IterationRecord) -> Result<(), StoreError> {
        self.with_chain(run, record.chain, |records| {
            check_append(
                record.chain,
                record.iteration,
                records.last().map(|r| r.iteration),
            )?;
            records.push(record.clone());
            Ok(())
        })
    }

    fn function_results(&self, run: u64, chain: u64) -> Result<Vec<FunctionResult>, StoreError> {
        self.with_chain(run, chain, |records| {
            Ok(records.iter().map(|r| r.function_result()).collect())
        })
    }

    fn parameter_results(&self, run: u64, chain: u64) -> Result<Vec<ParameterResult>, StoreError> {
        self.with_chain(run, chain, |records| {
            Ok(records.iter().flat_map(|r| r.parameter_results()).collect())
        })
    }

    fn last_iteration(&self, run: u64, chain: u64) -> Result<Option<u64>, StoreError> {
        self.with_chain(run, chain, |records| Ok(records.last().map(|r| r.iteration)))
    }
}
