//! The forward-simulation seam.
//!
//! The mechanistic model (unit handling, model composition, ODE solving) lives
//! outside this crate. It is consumed through [`ForwardModel`], which turns a
//! parameter vector and a set of time points into output trajectories.

use thiserror::Error;

/// Errors that happen while evaluating the log-posterior.
pub trait LogpError: std::error::Error {
    /// Unrecoverable errors stop the run, recoverable errors turn the
    /// candidate's log-posterior into negative infinity.
    fn is_recoverable(&self) -> bool;
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Parameters are outside the model's valid domain: {0}")]
    InvalidParameters(String),
    #[error("Solver failed: {0}")]
    Solver(String),
    #[error("Model has no output named '{0}'")]
    UnknownOutput(String),
    #[error("Model failed: {0}")]
    Internal(String),
}

impl LogpError for SimulationError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SimulationError::InvalidParameters(_) | SimulationError::Solver(_)
        )
    }
}

/// A deterministic mechanistic model.
///
/// The trait is thread-safe so a run can be moved to a background worker.
pub trait ForwardModel: Send + Sync + 'static {
    /// Names of the model parameters, in the order `simulate` expects them.
    fn parameter_names(&self) -> Vec<String>;

    /// Values used for parameters that no graph node binds.
    fn default_parameters(&self) -> Vec<f64>;

    /// Names of the variables `simulate` can report.
    fn outputs(&self) -> Vec<String>;

    /// Simulate `outputs` at `times`, returning one trajectory per output.
    fn simulate(
        &self,
        parameters: &[f64],
        outputs: &[&str],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, SimulationError>;
}

#[cfg(test)]
pub mod test_models {
    use super::{ForwardModel, SimulationError};

    /// One-compartment IV bolus: `conc(t) = dose / V * exp(-CL / V * t)`.
    #[derive(Debug, Clone)]
    pub struct OneCompartment {
        pub dose: f64,
        pub cl: f64,
        pub v: f64,
    }

    impl Default for OneCompartment {
        fn default() -> Self {
            Self {
                dose: 100.0,
                cl: 2.0,
                v: 10.0,
            }
        }
    }

    impl ForwardModel for OneCompartment {
        fn parameter_names(&self) -> Vec<String> {
            vec!["dose".into(), "CL".into(), "V".into()]
        }

        fn default_parameters(&self) -> Vec<f64> {
            vec![self.dose, self.cl, self.v]
        }

        fn outputs(&self) -> Vec<String> {
            vec!["central.conc".into(), "central.amount".into()]
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
            let k = cl / v;
            outputs
                .iter()
                .map(|&output| {
                    let scale = match output {
                        "central.conc" => dose / v,
                        "central.amount" => dose,
                        other => return Err(SimulationError::UnknownOutput(other.to_string())),
                    };
                    Ok(times.iter().map(|t| scale * (-k * t).exp()).collect())
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_models::OneCompartment;
    use super::*;

    #[test]
    fn recoverable_errors() {
        assert!(SimulationError::Solver("step size underflow".into()).is_recoverable());
        assert!(SimulationError::InvalidParameters("V<0".into()).is_recoverable());
        assert!(!SimulationError::UnknownOutput("x".into()).is_recoverable());
        assert!(!SimulationError::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn one_compartment_decays() {
        let model = OneCompartment::default();
        let out = model
            .simulate(&model.default_parameters(), &["central.conc"], &[0.0, 5.0])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0][0] - 10.0).abs() < 1e-12);
        assert!((out[0][1] - 10.0 * (-1.0f64).exp()).abs() < 1e-12);

        let err = model
            .simulate(&[100.0, 2.0, -1.0], &["central.conc"], &[0.0])
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
