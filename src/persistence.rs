//! Translation between flat vectors and named, durable iteration records.

use std::sync::Arc;

use crate::{
    error::StoreError,
    layout::{ParameterIndex, SlotKey},
    storage::{IterationRecord, RunStore},
};

/// The last durable state of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub iteration: u64,
    pub position: Box<[f64]>,
    pub log_posterior: f64,
}

/// Writes chain snapshots of one run and reads its resume points.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn RunStore>,
    run: u64,
}

impl Persistence {
    pub fn new(store: Arc<dyn RunStore>, run: u64) -> Self {
        Self { store, run }
    }

    pub fn store(&self) -> &dyn RunStore {
        self.store.as_ref()
    }

    pub fn write_snapshot(
        &self,
        index: &ParameterIndex,
        chain: u64,
        iteration: u64,
        position: &[f64],
        log_posterior: f64,
    ) -> Result<(), StoreError> {
        let parameters = index
            .label(position)
            .map_err(|err| StoreError::LayoutMismatch {
                chain,
                reason: err.to_string(),
            })?
            .map(|(slot, value)| (slot.clone(), value))
            .collect();
        let record = IterationRecord {
            chain,
            iteration,
            log_posterior,
            parameters,
        };
        self.store.append_iteration(self.run, &record)
    }

    /// Rebuild the last persisted vector of `chain` in the layout of `index`.
    pub fn resume_point(
        &self,
        index: &ParameterIndex,
        chain: u64,
    ) -> Result<Option<ResumePoint>, StoreError> {
        let Some(iteration) = self.store.last_iteration(self.run, chain)? else {
            return Ok(None);
        };
        let log_posterior = self
            .store
            .function_results(self.run, chain)?
            .last()
            .map(|r| r.value)
            .ok_or_else(|| StoreError::Corrupt(format!("chain {} has no function results", chain)))?;

        let mut position = vec![f64::NAN; index.len()];
        let mut seen = vec![false; index.len()];
        for result in self
            .store
            .parameter_results(self.run, chain)?
            .into_iter()
            .filter(|r| r.iteration == iteration)
        {
            let slot = SlotKey {
                name: result.node,
                element: result.index,
            };
            let pos = index
                .position(&slot)
                .ok_or_else(|| StoreError::LayoutMismatch {
                    chain,
                    reason: format!("unknown slot {}[{}]", slot.name, slot.element),
                })?;
            if seen[pos] {
                return Err(StoreError::LayoutMismatch {
                    chain,
                    reason: format!("slot {}[{}] stored twice", slot.name, slot.element),
                });
            }
            seen[pos] = true;
            position[pos] = result.value;
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            let slot = &index.slots()[missing];
            return Err(StoreError::LayoutMismatch {
                chain,
                reason: format!("slot {}[{}] was not stored", slot.name, slot.element),
            });
        }

        Ok(Some(ResumePoint {
            iteration,
            position: position.into(),
            log_posterior,
        }))
    }
}
