//! The run aggregate: settings, lifecycle state and cumulative counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{strategy::Algorithm, tasks::TaskId};

/// Settings of an inference run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Number of independent chains.
    pub num_chains: u64,
    /// Iteration budget per chain, not counting the initial snapshot.
    pub max_iterations: u64,
    /// Seed of the per-chain random number generators.
    pub seed: u64,
    pub algorithm: Algorithm,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            max_iterations: 1000,
            seed: 0,
            algorithm: Algorithm::default(),
        }
    }
}

impl RunSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Uninitialized,
    Compiled,
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    /// Completed iterations of the slowest chain.
    pub iterations: u64,
    /// Log-posterior evaluations over all chains.
    pub function_evaluations: u64,
    /// Wall time spent in the iteration loop.
    pub elapsed: Duration,
}

/// The durable record of one inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: u64,
    pub settings: RunSettings,
    pub state: RunState,
    pub counters: RunCounters,
    /// The background task currently executing the run, if any.
    pub task: Option<TaskId>,
    /// The message of the error that failed the run.
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(id: u64, settings: RunSettings) -> Self {
        Self {
            id,
            settings,
            state: RunState::Uninitialized,
            counters: RunCounters::default(),
            task: None,
            error: None,
        }
    }
}
