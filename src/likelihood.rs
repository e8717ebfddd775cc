//! Composition of the log-posterior over the free-parameter vector.

use std::sync::Arc;

use log::debug;

use crate::{
    compiler::{CompiledRun, ModelArgument, ObservedOutput},
    distribution::{log_density, log_likelihood},
    model::{ForwardModel, LogpError, SimulationError},
};

/// The log-likelihood of one observed output.
///
/// Every subject is simulated on its own time grid with its own parameter
/// values, so outputs with ragged sampling times are supported.
#[derive(Debug, Clone)]
pub struct OutputLikelihood<'a> {
    output: &'a ObservedOutput,
}

impl<'a> OutputLikelihood<'a> {
    pub fn new(output: &'a ObservedOutput) -> Self {
        Self { output }
    }

    pub fn log_likelihood(
        &self,
        model: &dyn ForwardModel,
        values: &[Vec<f64>],
    ) -> Result<f64, SimulationError> {
        let output = self.output;
        let mut parameters = Vec::with_capacity(output.parameters.len());
        let mut total = 0f64;
        for (row, subject) in output.subjects.iter().enumerate() {
            parameters.clear();
            parameters.extend(output.parameters.iter().map(|arg| match arg {
                ModelArgument::Default(value) => *value,
                ModelArgument::Node(operand) => operand.get(values, row),
            }));
            let scale = output.scale.get(values, row);

            let simulated = model.simulate(&parameters, &[output.output.as_str()], &subject.times)?;
            let predicted = simulated
                .into_iter()
                .next()
                .filter(|p| p.len() == subject.times.len())
                .ok_or_else(|| {
                    SimulationError::Internal(format!(
                        "model returned a trajectory of the wrong shape for '{}'",
                        output.output
                    ))
                })?;

            total += subject
                .values
                .iter()
                .zip(predicted.iter())
                .map(|(&observed, &predicted)| log_likelihood(output.noise, observed, predicted, scale))
                .sum::<f64>();
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        Ok(total)
    }
}

/// Sum of the log-likelihoods of all observed outputs.
pub struct CombinedLogLikelihood<'a> {
    outputs: Vec<OutputLikelihood<'a>>,
}

impl<'a> CombinedLogLikelihood<'a> {
    pub fn new(run: &'a CompiledRun) -> Self {
        Self {
            outputs: run.outputs.iter().map(OutputLikelihood::new).collect(),
        }
    }

    pub fn log_likelihood(
        &self,
        model: &dyn ForwardModel,
        values: &[Vec<f64>],
    ) -> Result<f64, SimulationError> {
        let mut total = 0f64;
        for output in &self.outputs {
            total += output.log_likelihood(model, values)?;
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        Ok(total)
    }
}

/// Sum of the densities of every free parameter element.
pub fn log_prior(run: &CompiledRun, position: &[f64], values: &[Vec<f64>]) -> f64 {
    run.free
        .iter()
        .flat_map(|param| {
            param.range().enumerate().map(move |(row, slot)| {
                let (a, b) = param.density.args(values, row);
                log_density(param.density.kind(), position[slot], a, b)
            })
        })
        .sum()
}

/// The log-posterior over the flat free-parameter vector of a compiled run.
#[derive(Clone)]
pub struct LogPosterior {
    run: Arc<CompiledRun>,
    model: Arc<dyn ForwardModel>,
}

impl LogPosterior {
    pub fn new(run: Arc<CompiledRun>, model: Arc<dyn ForwardModel>) -> Self {
        Self { run, model }
    }

    pub fn dim(&self) -> usize {
        self.run.dim()
    }

    pub fn compiled(&self) -> &CompiledRun {
        &self.run
    }

    /// Evaluate the log-posterior, reporting recoverable simulation failures
    /// as errors.
    pub fn try_logp(&self, position: &[f64]) -> Result<f64, SimulationError> {
        self.run
            .index
            .check_len(position)
            .map_err(|err| SimulationError::Internal(err.to_string()))?;
        let values = self.run.evaluate(position);
        let prior = log_prior(&self.run, position, &values);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        let likelihood =
            CombinedLogLikelihood::new(&self.run).log_likelihood(self.model.as_ref(), &values)?;
        let logp = prior + likelihood;
        if logp.is_nan() || logp == f64::INFINITY {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(logp)
    }

    /// Evaluate the log-posterior. Recoverable failures become negative
    /// infinity, unrecoverable ones are returned.
    pub fn logp(&self, position: &[f64]) -> Result<f64, SimulationError> {
        match self.try_logp(position) {
            Err(err) if err.is_recoverable() => {
                debug!("Rejecting candidate after recoverable failure: {}", err);
                Ok(f64::NEG_INFINITY)
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub mod test_graphs {
    use crate::{
        covariate::{InMemoryCovariates, Series},
        graph::{DistributionKind, LikelihoodNode, ParameterGraph, Prior},
    };

    /// One observed concentration series for a pooled one-compartment model
    /// with a free clearance and a fixed noise scale.
    pub fn pooled_clearance() -> (ParameterGraph, InMemoryCovariates) {
        let mut graph = ParameterGraph::new();
        let obs = graph.add_node(
            LikelihoodNode::distribution("conc", DistributionKind::Normal).with_covariate("conc"),
        );
        let pk = graph.add_node(LikelihoodNode::model("pk"));
        let cl = graph.add_node(
            LikelihoodNode::fixed("CL", 2.0).with_prior(Prior::log_normal(0.7, 0.5)),
        );
        let sigma = graph.add_node(LikelihoodNode::fixed("sigma", 0.5));
        graph.connect_named(obs, pk, 0, "central.conc").unwrap();
        graph.connect(obs, sigma, 1).unwrap();
        graph.connect(pk, cl, 0).unwrap();

        let times = vec![0.5, 1.0, 2.0, 4.0];
        let values = times.iter().map(|t: &f64| 10.0 * (-0.2 * t).exp()).collect();
        let covariates = InMemoryCovariates::new().with("conc", Series::pooled(times, values));
        (graph, covariates)
    }
}
