mod core;
mod csv;
mod memory;

pub use core::{FunctionResult, IterationRecord, ParameterResult, RunStore};
pub use csv::CsvStore;
pub use memory::MemoryStore;
