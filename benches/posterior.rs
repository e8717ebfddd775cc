use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pmx_infer::{
    compile, DistributionKind, ForwardModel, InMemoryCovariates, LikelihoodNode, LogPosterior,
    ParameterGraph, Prior, Series, SimulationError,
};

struct Bolus;

impl ForwardModel for Bolus {
    fn parameter_names(&self) -> Vec<String> {
        vec!["CL".into(), "V".into()]
    }

    fn default_parameters(&self) -> Vec<f64> {
        vec![2.0, 10.0]
    }

    fn outputs(&self) -> Vec<String> {
        vec!["conc".into()]
    }

    fn simulate(
        &self,
        parameters: &[f64],
        outputs: &[&str],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, SimulationError> {
        let (cl, v) = (parameters[0], parameters[1]);
        Ok(outputs
            .iter()
            .map(|_| times.iter().map(|t| 100.0 / v * (-cl / v * t).exp()).collect())
            .collect())
    }
}

fn population(subjects: u64) -> (ParameterGraph, InMemoryCovariates) {
    let mut graph = ParameterGraph::new();
    let obs = graph.add_node(
        LikelihoodNode::distribution("conc", DistributionKind::Normal).with_covariate("data"),
    );
    let pk = graph.add_node(LikelihoodNode::model("pk"));
    let cl = graph.add_node(LikelihoodNode::fixed("CL", 2.0).with_prior(Prior::log_normal(0.7, 0.5)));
    let v = graph.add_node(
        LikelihoodNode::distribution("V", DistributionKind::LogNormal).per_subject("data"),
    );
    let v_pop = graph.add_node(LikelihoodNode::fixed("V_pop", 2.3).with_prior(Prior::normal(2.3, 1.0)));
    let omega = graph.add_node(LikelihoodNode::fixed("omega", 0.2));
    let sigma = graph.add_node(LikelihoodNode::fixed("sigma", 0.5));
    graph.connect_named(obs, pk, 0, "conc").unwrap();
    graph.connect(obs, sigma, 1).unwrap();
    graph.connect(pk, cl, 0).unwrap();
    graph.connect(pk, v, 1).unwrap();
    graph.connect(v, v_pop, 0).unwrap();
    graph.connect(v, omega, 1).unwrap();

    let times = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0];
    let mut series = Series::default();
    for subject in 0..subjects {
        for t in times {
            series.times.push(t);
            series.values.push(10.0 * (-0.2 * t).exp());
            series.subjects.push(subject);
        }
    }
    (graph, InMemoryCovariates::new().with("data", series))
}

fn criterion_benchmark(c: &mut Criterion) {
    for subjects in [1, 50] {
        let (graph, covariates) = population(subjects);
        let compiled = Arc::new(compile(&graph, &Bolus, &covariates).unwrap());
        let initial = compiled.initial.clone();
        let posterior = LogPosterior::new(compiled, Arc::new(Bolus));

        c.bench_function(&format!("logp {} subjects", subjects), |b| {
            b.iter(|| posterior.logp(black_box(&initial)).unwrap())
        });

        c.bench_function(&format!("compile {} subjects", subjects), |b| {
            b.iter_batched(
                || graph.clone(),
                |graph| compile(&graph, &Bolus, &covariates).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
