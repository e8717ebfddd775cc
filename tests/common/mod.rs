#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use pmx_infer::{
    DistributionKind, ForwardModel, FunctionResult, InMemoryCovariates, IterationRecord,
    LikelihoodNode, ParameterGraph, ParameterResult, Prior, RunRecord, RunStore, Series,
    SimulationError, StoreError,
};

/// One-compartment IV bolus: `conc(t) = dose / V * exp(-CL / V * t)`.
pub struct OneCompartment;

impl ForwardModel for OneCompartment {
    fn parameter_names(&self) -> Vec<String> {
        vec!["dose".into(), "CL".into(), "V".into()]
    }

    fn default_parameters(&self) -> Vec<f64> {
        vec![100.0, 2.0, 10.0]
    }

    fn outputs(&self) -> Vec<String> {
        vec!["central.conc".into()]
    }

    fn simulate(
        &self,
        parameters: &[f64],
        outputs: &[&str],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, SimulationError> {
        let [dose, cl, v] = [parameters[0], parameters[1], parameters[2]];
        if !(v > 0.0) || !(cl >= 0.0) {
            return Err(SimulationError::InvalidParameters(format!(
                "CL={}, V={}",
                cl, v
            )));
        }
        Ok(outputs
            .iter()
            .map(|_| times.iter().map(|t| dose / v * (-cl / v * t).exp()).collect())
            .collect())
    }
}

/// The one-compartment model, failing unrecoverably after `limit` simulations.
pub struct FailAfter {
    calls: AtomicUsize,
    limit: usize,
}

impl FailAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            limit,
        }
    }
}

impl ForwardModel for FailAfter {
    fn parameter_names(&self) -> Vec<String> {
        OneCompartment.parameter_names()
    }

    fn default_parameters(&self) -> Vec<f64> {
        OneCompartment.default_parameters()
    }

    fn outputs(&self) -> Vec<String> {
        OneCompartment.outputs()
    }

    fn simulate(
        &self,
        parameters: &[f64],
        outputs: &[&str],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, SimulationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(SimulationError::Internal("solver library crashed".into()));
        }
        OneCompartment.simulate(parameters, outputs, times)
    }
}

pub fn concentrations() -> Series {
    let times = vec![0.5, 1.0, 2.0, 4.0];
    let values = times
        .iter()
        .map(|t: &f64| 10.0 * (-0.2 * t).exp() * 1.02)
        .collect();
    Series::pooled(times, values)
}

/// One model node, a free clearance, a fixed noise scale and one observed
/// output bound to a 4-point series.
pub fn one_output() -> (ParameterGraph, InMemoryCovariates) {
    let mut graph = ParameterGraph::new();
    let obs = graph.add_node(
        LikelihoodNode::distribution("conc", DistributionKind::Normal).with_covariate("conc_data"),
    );
    let pk = graph.add_node(LikelihoodNode::model("pk"));
    let cl = graph.add_node(LikelihoodNode::fixed("CL", 2.0).with_prior(Prior::log_normal(0.7, 0.5)));
    let sigma = graph.add_node(LikelihoodNode::fixed("sigma", 0.5));
    graph.connect_named(obs, pk, 0, "central.conc").unwrap();
    graph.connect(obs, sigma, 1).unwrap();
    graph.connect(pk, cl, 0).unwrap();

    let covariates = InMemoryCovariates::new().with("conc_data", concentrations());
    (graph, covariates)
}

/// Wraps a store and fails every append after the first `limit`.
pub struct FlakyStore<S> {
    inner: S,
    appends: AtomicUsize,
    limit: usize,
}

impl<S: RunStore> FlakyStore<S> {
    pub fn new(inner: S, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            appends: AtomicUsize::new(0),
            limit,
        })
    }
}

impl<S: RunStore> RunStore for FlakyStore<S> {
    fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.save_run(run)
    }

    fn load_run(&self, run: u64) -> Result<RunRecord, StoreError> {
        self.inner.load_run(run)
    }

    fn delete_run(&self, run: u64) -> Result<(), StoreError> {
        self.inner.delete_run(run)
    }

    fn create_chain(&self, run: u64, chain: u64) -> Result<(), StoreError> {
        self.inner.create_chain(run, chain)
    }

    fn chains(&self, run: u64) -> Result<Vec<u64>, StoreError> {
        self.inner.chains(run)
    }

    fn delete_chains(&self, run: u64) -> Result<(), StoreError> {
        self.inner.delete_chains(run)
    }

    fn append_iteration(&self, run: u64, record: &IterationRecord) -> Result<(), StoreError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            )));
        }
        self.inner.append_iteration(run, record)
    }

    fn function_results(&self, run: u64, chain: u64) -> Result<Vec<FunctionResult>, StoreError> {
        self.inner.function_results(run, chain)
    }

    fn parameter_results(&self, run: u64, chain: u64) -> Result<Vec<ParameterResult>, StoreError> {
        self.inner.parameter_results(run, chain)
    }

    fn last_iteration(&self, run: u64, chain: u64) -> Result<Option<u64>, StoreError> {
        self.inner.last_iteration(run, chain)
    }
}

pub fn iterations(store: &dyn RunStore, run: u64, chain: u64) -> Vec<u64> {
    store
        .function_results(run, chain)
        .unwrap()
        .iter()
        .map(|r| r.iteration)
        .collect()
}
