//! Directory-backed store with one append-only CSV file per chain.
//!
//! Layout of the store directory:
//!
//! ```text
//! run_<id>/run.json         the run record
//! run_<id>/chain_<c>.csv    iteration,kind,name,index,value
//! ```
//!
//! The parameter rows of an iteration are written before its `logp` row. The
//! `logp` row commits the iteration: rows after the last `logp` row belong to
//! an iteration that was interrupted and are dropped when the store is opened.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, warn};

use super::core::{check_append, FunctionResult, IterationRecord, ParameterResult, RunStore};
use crate::{error::StoreError, layout::SlotKey, run::RunRecord};

const HEADER: &str = "iteration,kind,name,index,value";

pub struct CsvStore {
    root: PathBuf,
    chains: Mutex<HashMap<u64, BTreeMap<u64, ChainState>>>,
}

/// What is committed in one chain file.
#[derive(Debug, Clone, Copy)]
struct ChainState {
    last: Option<u64>,
    /// Byte length of the file up to and including the last `logp` row.
    committed: u64,
}

enum Entry {
    Param(SlotKey, f64),
    Logp(f64),
}

struct Row {
    iteration: u64,
    entry: Entry,
}

fn parse_row(line: &str) -> Option<Row> {
    let mut head = line.splitn(3, ',');
    let iteration = head.next()?.parse().ok()?;
    let kind = head.next()?;
    let mut tail = head.next()?.rsplitn(3, ',');
    let value: f64 = tail.next()?.parse().ok()?;
    let index: usize = tail.next()?.parse().ok()?;
    let name = tail.next()?;
    let entry = match kind {
        "param" => Entry::Param(
            SlotKey {
                name: name.to_string(),
                element: index,
            },
            value,
        ),
        "logp" => Entry::Logp(value),
        _ => return None,
    };
    Some(Row { iteration, entry })
}

struct ChainScan {
    records: Vec<IterationRecord>,
    committed_len: u64,
    file_len: u64,
}

fn scan_chain(path: &Path, chain: u64) -> Result<ChainScan, StoreError> {
    let content = fs::read_to_string(path)?;
    let mut records: Vec<IterationRecord> = Vec::new();
    let mut pending: Vec<(SlotKey, f64)> = Vec::new();
    let mut pending_iteration = None;
    let mut offset = 0u64;
    let mut committed_len = 0u64;

    for (number, line) in content.split_inclusive('\n').enumerate() {
        offset += line.len() as u64;
        let Some(line) = line.strip_suffix('\n') else {
            // torn write
            break;
        };
        if number == 0 && line == HEADER {
            committed_len = offset;
            continue;
        }
        let row = parse_row(line).ok_or_else(|| {
            StoreError::Corrupt(format!("{}:{}: malformed row", path.display(), number + 1))
        })?;
        match row.entry {
            Entry::Param(slot, value) => {
                if pending_iteration != Some(row.iteration) {
                    pending.clear();
                    pending_iteration = Some(row.iteration);
                }
                pending.push((slot, value));
            }
            Entry::Logp(value) => {
                let parameters = if pending_iteration == Some(row.iteration) {
                    std::mem::take(&mut pending)
                } else {
                    Vec::new()
                };
                pending.clear();
                pending_iteration = None;
                if let Some(last) = records.last() {
                    if row.iteration <= last.iteration {
                        return Err(StoreError::Corrupt(format!(
                            "{}:{}: iteration {} follows iteration {}",
                            path.display(),
                            number + 1,
                            row.iteration,
                            last.iteration
                        )));
                    }
                }
                records.push(IterationRecord {
                    chain,
                    iteration: row.iteration,
                    log_posterior: value,
                    parameters,
                });
                committed_len = offset;
            }
        }
    }
    Ok(ChainScan {
        records,
        committed_len,
        file_len: content.len() as u64,
    })
}

fn parse_id(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

impl CsvStore {
    /// Open the store in `root`, creating the directory if needed.
    ///
    /// Uncommitted trailing rows of every chain file are truncated.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut runs = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(run) = parse_id(&name.to_string_lossy(), "run_", "") else {
                continue;
            };
            if !entry.path().join("run.json").exists() {
                warn!("Ignoring run directory without a run record: {}", entry.path().display());
                continue;
            }
            let mut chains = BTreeMap::new();
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let Some(chain) = parse_id(&file.file_name().to_string_lossy(), "chain_", ".csv")
                else {
                    continue;
                };
                let path = file.path();
                let scan = scan_chain(&path, chain)?;
                if scan.committed_len < scan.file_len {
                    debug!(
                        "Dropping {} bytes of an uncommitted iteration from {}",
                        scan.file_len - scan.committed_len,
                        path.display()
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(scan.committed_len)?;
                    file.sync_all()?;
                }
                chains.insert(
                    chain,
                    ChainState {
                        last: scan.records.last().map(|r| r.iteration),
                        committed: scan.committed_len,
                    },
                );
            }
            runs.insert(run, chains);
        }

        Ok(Self {
            root,
            chains: Mutex::new(runs),
        })
    }

    fn run_dir(&self, run: u64) -> PathBuf {
        self.root.join(format!("run_{}", run))
    }

    fn chain_path(&self, run: u64, chain: u64) -> PathBuf {
        self.run_dir(run).join(format!("chain_{}.csv", chain))
    }

    fn read_chain(&self, run: u64, chain: u64) -> Result<Vec<IterationRecord>, StoreError> {
        {
            let chains = self.chains.lock().expect("Poisoned lock");
            let run_chains = chains.get(&run).ok_or(StoreError::UnknownRun(run))?;
            if !run_chains.contains_key(&chain) {
                return Err(StoreError::UnknownChain { run, chain });
            }
        }
        Ok(scan_chain(&self.chain_path(run, chain), chain)?.records)
    }
}

impl RunStore for CsvStore {
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().expect("Poisoned lock");
        let dir = self.run_dir(run.id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(run)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let tmp = dir.join("run.json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, dir.join("run.json"))?;
        chains.entry(run.id).or_default();
        Ok(())
    }

    fn load_run(&self, run: u64) -> Result<RunRecord, StoreError> {
        {
            let chains = self.chains.lock().expect("Poisoned lock");
            if !chains.contains_key(&run) {
                return Err(StoreError::UnknownRun(run));
            }
        }
        let json = fs::read_to_string(self.run_dir(run).join("run.json"))?;
        serde_json::from_str(&json).map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    fn delete_run(&self, run: u64) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().expect("Poisoned lock");
        chains.remove(&run).ok_or(StoreError::UnknownRun(run))?;
        fs::remove_dir_all(self.run_dir(run))?;
        Ok(())
    }

    fn create_chain(&self, run: u64, chain: u64) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().expect("Poisoned lock");
        let run_chains = chains.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        if run_chains.contains_key(&chain) {
            return Ok(());
        }
        let mut file = File::create(self.chain_path(run, chain))?;
        writeln!(file, "{}", HEADER)?;
        file.sync_all()?;
        run_chains.insert(
            chain,
            ChainState {
                last: None,
                committed: file.stream_position()?,
            },
        );
        Ok(())
    }

    fn chains(&self, run: u64) -> Result<Vec<u64>, StoreError> {
        let chains = self.chains.lock().expect("Poisoned lock");
        let run_chains = chains.get(&run).ok_or(StoreError::UnknownRun(run))?;
        Ok(run_chains.keys().copied().collect())
    }

    fn delete_chains(&self, run: u64) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().expect("Poisoned lock");
        let run_chains = chains.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        for chain in run_chains.keys() {
            fs::remove_file(self.chain_path(run, *chain))?;
        }
        run_chains.clear();
        Ok(())
    }

    fn append_iteration(&self, run: u64, record: &IterationRecord) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().expect("Poisoned lock");
        let run_chains = chains.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        let state = run_chains
            .get_mut(&record.chain)
            .ok_or(StoreError::UnknownChain {
                run,
                chain: record.chain,
            })?;
        check_append(record.chain, record.iteration, state.last)?;
        if let Some((slot, _)) = record.parameters.iter().find(|(s, _)| s.name.contains('\n')) {
            return Err(StoreError::Corrupt(format!(
                "parameter name {:?} cannot be stored",
                slot.name
            )));
        }

        // rows of an earlier failed append are overwritten
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.chain_path(run, record.chain))?;
        file.set_len(state.committed)?;
        file.seek(SeekFrom::Start(state.committed))?;
        let mut writer = BufWriter::new(file);
        for (slot, value) in record.parameters.iter() {
            writeln!(
                writer,
                "{},param,{},{},{}",
                record.iteration, slot.name, slot.element, value
            )?;
        }
        writeln!(writer, "{},logp,logp,0,{}", record.iteration, record.log_posterior)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        state.committed = writer.stream_position()?;
        state.last = Some(record.iteration);
        Ok(())
    }

    fn function_results(&self, run: u64, chain: u64) -> Result<Vec<FunctionResult>, StoreError> {
        Ok(self
            .read_chain(run, chain)?
            .iter()
            .map(|r| r.function_result())
            .collect())
    }

    fn parameter_results(&self, run: u64, chain: u64) -> Result<Vec<ParameterResult>, StoreError> {
        Ok(self
            .read_chain(run, chain)?
            .iter()
            .flat_map(|r| r.parameter_results())
            .collect())
    }

    fn last_iteration(&self, run: u64, chain: u64) -> Result<Option<u64>, StoreError> {
        let chains = self.chains.lock().expect("Poisoned lock");
        let run_chains = chains.get(&run).ok_or(StoreError::UnknownRun(run))?;
        run_chains
            .get(&chain)
            .map(|state| state.last)
            .ok_or(StoreError::UnknownChain { run, chain })
    }
}
