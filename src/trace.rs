//! Read back the persisted trajectories of a run.

use anyhow::{bail, Context, Result};
use arrow::array::{FixedSizeListArray, FixedSizeListBuilder, Float64Array, Float64Builder};

use crate::{layout::SlotKey, storage::RunStore};

/// The persisted iterations of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    pub chain: u64,
    pub iterations: Vec<u64>,
    pub log_posterior: Vec<f64>,
    /// Labels of the draw elements.
    pub slots: Vec<SlotKey>,
    /// One point per iteration in vector order.
    pub draws: Vec<Box<[f64]>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestPoint<'a> {
    pub chain: u64,
    pub iteration: u64,
    pub log_posterior: f64,
    pub position: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub run: u64,
    pub chains: Vec<ChainTrace>,
}

impl ChainTrace {
    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn draws_array(&self) -> FixedSizeListArray {
        let mut builder = FixedSizeListBuilder::with_capacity(
            Float64Builder::with_capacity(self.len() * self.slots.len()),
            self.slots.len() as i32,
            self.len(),
        );
        for draw in self.draws.iter() {
            builder.values().append_slice(draw);
            builder.append(true);
        }
        builder.finish()
    }

    pub fn logp_array(&self) -> Float64Array {
        Float64Array::from(self.log_posterior.clone())
    }
}

impl Trace {
    pub fn load(store: &dyn RunStore, run: u64) -> Result<Self> {
        let chains = store
            .chains(run)
            .with_context(|| format!("Could not list chains of run {}", run))?
            .into_iter()
            .map(|chain| load_chain(store, run, chain))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { run, chains })
    }

    /// The point with the largest log-posterior over all chains.
    pub fn best(&self) -> Option<BestPoint<'_>> {
        self.chains
            .iter()
            .flat_map(|trace| {
                (0..trace.len()).map(move |i| BestPoint {
                    chain: trace.chain,
                    iteration: trace.iterations[i],
                    log_posterior: trace.log_posterior[i],
                    position: &trace.draws[i],
                })
            })
            .filter(|point| !point.log_posterior.is_nan())
            .max_by(|a, b| a.log_posterior.total_cmp(&b.log_posterior))
    }
}

fn load_chain(store: &dyn RunStore, run: u64, chain: u64) -> Result<ChainTrace> {
    let functions = store
        .function_results(run, chain)
        .with_context(|| format!("Could not read function results of chain {}", chain))?;
    let parameters = store
        .parameter_results(run, chain)
        .with_context(|| format!("Could not read parameter results of chain {}", chain))?;

    let mut slots: Option<Vec<SlotKey>> = None;
    let mut draws = Vec::with_capacity(functions.len());
    let mut rest = parameters.as_slice();
    for function in functions.iter() {
        let count = rest
            .iter()
            .take_while(|p| p.iteration == function.iteration)
            .count();
        let (current, tail) = rest.split_at(count);
        rest = tail;

        let labels: Vec<SlotKey> = current
            .iter()
            .map(|p| SlotKey {
                name: p.node.clone(),
                element: p.index,
            })
            .collect();
        if slots.is_none() {
            slots = Some(labels);
        } else if slots.as_ref() != Some(&labels) {
            bail!(
                "Chain {} changes its parameter layout at iteration {}",
                chain,
                function.iteration
            );
        }
        draws.push(current.iter().map(|p| p.value).collect());
    }
    if !rest.is_empty() {
        bail!("Chain {} has parameter results without a function result", chain);
    }

    Ok(ChainTrace {
        chain,
        iterations: functions.iter().map(|f| f.iteration).collect(),
        log_posterior: functions.iter().map(|f| f.value).collect(),
        slots: slots.unwrap_or_default(),
        draws,
    })
}
