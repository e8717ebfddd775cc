//! Compile a [`ParameterGraph`] into a flat parameter vector contract.
//!
//! The compiler is a pure function of the graph, the forward model's
//! signature and the covariate datasets. It splits nodes into fixed and free
//! parameters, lays the free ones out in declaration order, resolves equation
//! nodes into a topologically ordered value program and binds every observed
//! output to the model and its noise scale.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use crate::{
    covariate::{CovariateSource, Series, SubjectSeries},
    distribution::typical_value,
    error::CompileError,
    expr::CompiledExpr,
    graph::{DistributionKind, LikelihoodNode, NodeForm, NodeId, ParameterGraph, Pooling},
    layout::{Density, FreeParameter, Operand, ParameterIndex},
    model::ForwardModel,
};

#[derive(Debug, Clone)]
enum Step {
    Fixed(Vec<f64>),
    Free {
        offset: usize,
        length: usize,
    },
    Equation {
        expr: CompiledExpr,
        inputs: Vec<Operand>,
        length: usize,
    },
}

/// Computes the value of every valued node from a parameter vector.
#[derive(Debug, Clone)]
pub(crate) struct ValueProgram {
    steps: Vec<Step>,
}

impl ValueProgram {
    pub(crate) fn evaluate(&self, position: &[f64]) -> Vec<Vec<f64>> {
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(self.steps.len());
        let mut args = Vec::new();
        for step in &self.steps {
            let value = match step {
                Step::Fixed(v) => v.clone(),
                Step::Free { offset, length } => position[*offset..offset + length].to_vec(),
                Step::Equation {
                    expr,
                    inputs,
                    length,
                } => (0..*length)
                    .map(|row| {
                        args.clear();
                        args.extend(inputs.iter().map(|op| op.get(&values, row)));
                        expr.eval(&args)
                    })
                    .collect(),
            };
            values.push(value);
        }
        values
    }
}

/// How a model parameter is supplied for one observed output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ModelArgument {
    Default(f64),
    Node(Operand),
}

/// An observed output bound to the forward model and a noise model.
#[derive(Debug, Clone)]
pub struct ObservedOutput {
    pub node: NodeId,
    pub name: String,
    /// The simulated model variable compared against the data.
    pub output: String,
    pub noise: DistributionKind,
    /// Observations grouped per subject, each with its own time grid.
    pub subjects: Vec<SubjectSeries>,
    pub(crate) scale: Operand,
    pub(crate) parameters: Vec<ModelArgument>,
}

/// The immutable result of compiling one run.
#[derive(Debug, Clone)]
pub struct CompiledRun {
    /// Values of fixed nodes and of equations that only depend on fixed values.
    pub fixed: BTreeMap<String, Vec<f64>>,
    /// Free parameters in vector order.
    pub free: Vec<FreeParameter>,
    pub index: ParameterIndex,
    /// Every equation node evaluated at the initial vector.
    pub equations: BTreeMap<String, Vec<f64>>,
    pub initial: Box<[f64]>,
    pub outputs: Vec<ObservedOutput>,
    pub(crate) program: ValueProgram,
}

impl CompiledRun {
    pub fn dim(&self) -> usize {
        self.index.len()
    }

    /// Value of a pooled fixed node.
    pub fn fixed_value(&self, name: &str) -> Option<f64> {
        self.fixed
            .get(name)
            .filter(|v| v.len() == 1)
            .map(|v| v[0])
    }

    pub(crate) fn evaluate(&self, position: &[f64]) -> Vec<Vec<f64>> {
        self.program.evaluate(position)
    }
}

/// Compile `graph` for one run.
pub fn compile(
    graph: &ParameterGraph,
    model: &dyn ForwardModel,
    covariates: &dyn CovariateSource,
) -> Result<CompiledRun, CompileError> {
    Compiler::new(graph, model, covariates).run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Fixed,
    Equation,
    FreePrior,
    Population,
    Model,
    Observed,
}

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Pooled,
    PerSubject(Vec<u64>),
}

impl Shape {
    fn len(&self) -> usize {
        match self {
            Shape::Pooled => 1,
            Shape::PerSubject(subjects) => subjects.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Visit {
    InProgress,
    Done(usize),
}

struct Compiler<'a> {
    graph: &'a ParameterGraph,
    model: &'a dyn ForwardModel,
    covariates: &'a dyn CovariateSource,
    roles: HashMap<NodeId, Role>,
    free_layout: HashMap<NodeId, (usize, Shape)>,
    state: HashMap<NodeId, Visit>,
    covariate_steps: HashMap<String, usize>,
    steps: Vec<Step>,
    shapes: Vec<Shape>,
    step_names: Vec<String>,
    depends_on_free: Vec<bool>,
}

impl<'a> Compiler<'a> {
    fn new(
        graph: &'a ParameterGraph,
        model: &'a dyn ForwardModel,
        covariates: &'a dyn CovariateSource,
    ) -> Self {
        Self {
            graph,
            model,
            covariates,
            roles: HashMap::new(),
            free_layout: HashMap::new(),
            state: HashMap::new(),
            covariate_steps: HashMap::new(),
            steps: Vec::new(),
            shapes: Vec::new(),
            step_names: Vec::new(),
            depends_on_free: Vec::new(),
        }
    }

    fn run(mut self) -> Result<CompiledRun, CompileError> {
        let mut seen = HashSet::new();
        for (_, node) in self.graph.nodes() {
            if !seen.insert(node.name.as_str()) {
                return Err(CompileError::DuplicateName(node.name.clone()));
            }
        }
        self.graph.validate_edges()?;

        for (id, node) in self.graph.nodes() {
            let role = self.classify(id, node)?;
            self.roles.insert(id, role);
        }

        // Vector layout follows declaration order, independent of dependencies.
        let mut free_ids = Vec::new();
        let mut offset = 0;
        for (id, node) in self.graph.nodes() {
            if matches!(self.roles[&id], Role::FreePrior | Role::Population) {
                let shape = self.own_shape(node)?;
                let length = shape.len();
                self.free_layout.insert(id, (offset, shape));
                free_ids.push(id);
                offset += length;
            }
        }

        let valued: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|(id, _)| !matches!(self.roles[id], Role::Model | Role::Observed))
            .map(|(id, _)| id)
            .collect();
        for id in valued.iter() {
            self.visit(*id)?;
        }
        self.check_edge_lengths()?;

        let free = free_ids
            .iter()
            .map(|id| self.free_parameter(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let observed: Vec<NodeId> = self
            .graph
            .nodes()
            .filter(|(id, _)| self.roles[id] == Role::Observed)
            .map(|(id, _)| id)
            .collect();
        if observed.is_empty() {
            return Err(CompileError::NoObservedOutputs);
        }
        let outputs = observed
            .iter()
            .map(|id| self.observed_output(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let index = ParameterIndex::from_free(&free);
        let program = ValueProgram {
            steps: self.steps.clone(),
        };
        let initial = self.initial_position(&program, &free, offset);
        let values = program.evaluate(&initial);

        let mut fixed = BTreeMap::new();
        let mut equations = BTreeMap::new();
        for id in valued {
            let Visit::Done(step) = self.state[&id] else {
                unreachable!("every valued node is visited");
            };
            let name = self.step_names[step].clone();
            match self.roles[&id] {
                Role::Fixed => {
                    fixed.insert(name, values[step].clone());
                }
                Role::Equation => {
                    if !self.depends_on_free[step] {
                        fixed.insert(name.clone(), values[step].clone());
                    }
                    equations.insert(name, values[step].clone());
                }
                _ => {}
            }
        }

        debug!(
            "Compiled {} nodes into {} free slots, {} fixed values and {} observed outputs",
            self.graph.len(),
            index.len(),
            fixed.len(),
            outputs.len()
        );

        Ok(CompiledRun {
            fixed,
            free,
            index,
            equations,
            initial: initial.into(),
            outputs,
            program,
        })
    }

    fn classify(&self, id: NodeId, node: &LikelihoodNode) -> Result<Role, CompileError> {
        let invalid = |reason: &str| CompileError::InvalidNode {
            node: node.name.clone(),
            reason: reason.to_string(),
        };
        let role = match node.form {
            NodeForm::Model => Role::Model,
            NodeForm::Fixed if node.prior.is_some() => return Ok(Role::FreePrior),
            NodeForm::Fixed => Role::Fixed,
            NodeForm::Equation => {
                if node.expression.is_none() {
                    return Err(invalid("equation node has no expression"));
                }
                Role::Equation
            }
            NodeForm::Distribution(_) => {
                let first_arg = self.graph.arguments(id).first().map(|e| e.child);
                let bound_to_model = first_arg
                    .and_then(|child| self.graph.node(child))
                    .is_some_and(|n| n.form == NodeForm::Model);
                if node.covariate.is_some() && bound_to_model {
                    Role::Observed
                } else {
                    Role::Population
                }
            }
        };
        if node.prior.is_some() {
            return Err(invalid("only fixed nodes can carry a prior"));
        }
        Ok(role)
    }

    fn series(&self, node: &str, dataset: &str) -> Result<Series, CompileError> {
        let series = self
            .covariates
            .lookup(dataset)
            .ok_or_else(|| CompileError::MissingData {
                node: node.to_string(),
                reason: format!("dataset '{}' not found", dataset),
            })?;
        if !series.is_consistent() {
            return Err(CompileError::MissingData {
                node: node.to_string(),
                reason: format!("columns of dataset '{}' differ in length", dataset),
            });
        }
        if series.is_empty() {
            return Err(CompileError::MissingData {
                node: node.to_string(),
                reason: format!("dataset '{}' has no rows", dataset),
            });
        }
        Ok(series)
    }

    fn own_shape(&self, node: &LikelihoodNode) -> Result<Shape, CompileError> {
        if node.pooling == Pooling::Pooled {
            return Ok(Shape::Pooled);
        }
        let dataset = node
            .covariate
            .as_deref()
            .ok_or_else(|| CompileError::MissingData {
                node: node.name.clone(),
                reason: "per-subject node is not bound to a dataset".to_string(),
            })?;
        let subjects = self.series(&node.name, dataset)?.subject_ids();
        if let Some(length) = node.length {
            if length != subjects.len() {
                return Err(CompileError::InvalidNode {
                    node: node.name.clone(),
                    reason: format!(
                        "length {} does not match the {} subjects of '{}'",
                        length,
                        subjects.len(),
                        dataset
                    ),
                });
            }
        }
        Ok(Shape::PerSubject(subjects))
    }

    fn check_edge_lengths(&self) -> Result<(), CompileError> {
        for edge in self.graph.edges() {
            let Some(length) = edge.length else {
                continue;
            };
            let parent = self.node(edge.parent)?;
            let child = self.node(edge.child)?;
            let Some(Visit::Done(step)) = self.state.get(&edge.child) else {
                return Err(CompileError::InvalidEdges {
                    node: parent.name.clone(),
                    reason: format!("argument '{}' has no value to measure", child.name),
                });
            };
            let actual = self.shapes[*step].len();
            if actual != length {
                return Err(CompileError::InvalidEdges {
                    node: parent.name.clone(),
                    reason: format!(
                        "argument '{}' declares length {} but expands to {}",
                        child.name, length, actual
                    ),
                });
            }
        }
        Ok(())
    }

    fn push_step(&mut self, step: Step, shape: Shape, name: String, free: bool) -> usize {
        self.steps.push(step);
        self.shapes.push(shape);
        self.step_names.push(name);
        self.depends_on_free.push(free);
        self.steps.len() - 1
    }

    fn node(&self, id: NodeId) -> Result<&'a LikelihoodNode, CompileError> {
        let graph = self.graph;
        graph.node(id).ok_or_else(|| CompileError::InvalidEdges {
            node: format!("#{}", id.0),
            reason: "edge points to a removed node".to_string(),
        })
    }

    /// Depth-first resolution of a node's value, detecting cycles.
    fn visit(&mut self, id: NodeId) -> Result<usize, CompileError> {
        let graph = self.graph;
        let node = self.node(id)?;
        match self.state.get(&id) {
            Some(Visit::Done(step)) => return Ok(*step),
            Some(Visit::InProgress) => return Err(CompileError::Cycle(node.name.clone())),
            None => {}
        }
        self.state.insert(id, Visit::InProgress);

        let role = self.roles[&id];
        let (step, shape, free) = match role {
            Role::Fixed => {
                let shape = self.own_shape(node)?;
                let values = match &shape {
                    Shape::Pooled => vec![node.value.ok_or_else(|| CompileError::InvalidNode {
                        node: node.name.clone(),
                        reason: "fixed node has no value".to_string(),
                    })?],
                    Shape::PerSubject(_) => {
                        let dataset = node.covariate.as_deref().unwrap_or_default();
                        self.series(&node.name, dataset)?
                            .first_per_subject()
                            .into_iter()
                            .map(|(_, v)| v)
                            .collect()
                    }
                };
                (Step::Fixed(values), shape, false)
            }
            Role::FreePrior | Role::Population => {
                if role == Role::Population {
                    for edge in graph.arguments(id) {
                        self.visit(edge.child)?;
                    }
                }
                let (offset, shape) = self.free_layout[&id].clone();
                let length = shape.len();
                (Step::Free { offset, length }, shape, true)
            }
            Role::Equation => self.equation(id, node)?,
            Role::Model | Role::Observed => {
                return Err(CompileError::InvalidNode {
                    node: node.name.clone(),
                    reason: "model and observed nodes have no value of their own".to_string(),
                })
            }
        };

        let step = self.push_step(step, shape, node.name.clone(), free);
        self.state.insert(id, Visit::Done(step));
        Ok(step)
    }

    fn equation(
        &mut self,
        id: NodeId,
        node: &LikelihoodNode,
    ) -> Result<(Step, Shape, bool), CompileError> {
        let source = node.expression.as_deref().unwrap_or_default();
        let expr = CompiledExpr::compile(source).map_err(|e| CompileError::Expression {
            node: node.name.clone(),
            message: e.to_string(),
        })?;

        let graph = self.graph;
        let args = graph.arguments(id);
        let mut sources = Vec::with_capacity(expr.variables().len());
        for var in expr.variables() {
            let bound = args
                .iter()
                .find(|e| e.name.as_deref() == Some(var.as_str()))
                .or_else(|| {
                    args.iter().find(|e| {
                        e.name.is_none() && graph.node(e.child).is_some_and(|n| n.name == *var)
                    })
                })
                .map(|e| e.child)
                .or_else(|| graph.find(var));
            let step = match bound {
                Some(child) => self.visit(child)?,
                None => self.covariate_step(&node.name, var)?,
            };
            sources.push(step);
        }

        let shape = sources
            .iter()
            .map(|s| &self.shapes[*s])
            .find(|s| matches!(s, Shape::PerSubject(_)))
            .cloned()
            .unwrap_or(Shape::Pooled);
        let inputs = sources
            .iter()
            .map(|s| self.operand(*s, &shape, &node.name))
            .collect::<Result<Vec<_>, _>>()?;
        let free = sources.iter().any(|s| self.depends_on_free[*s]);
        let length = shape.len();
        Ok((
            Step::Equation {
                expr,
                inputs,
                length,
            },
            shape,
            free,
        ))
    }

    /// An external subject-level covariate referenced by name from an equation.
    fn covariate_step(&mut self, node: &str, name: &str) -> Result<usize, CompileError> {
        if let Some(step) = self.covariate_steps.get(name) {
            return Ok(*step);
        }
        if self.covariates.lookup(name).is_none() {
            return Err(CompileError::UnresolvedReference {
                node: node.to_string(),
                name: name.to_string(),
            });
        }
        let (subjects, values): (Vec<u64>, Vec<f64>) =
            self.series(node, name)?.first_per_subject().into_iter().unzip();
        let step = self.push_step(
            Step::Fixed(values),
            Shape::PerSubject(subjects),
            name.to_string(),
            false,
        );
        self.covariate_steps.insert(name.to_string(), step);
        Ok(step)
    }

    fn operand(&self, source: usize, consumer: &Shape, name: &str) -> Result<Operand, CompileError> {
        let rows = match (&self.shapes[source], consumer) {
            (Shape::Pooled, c) => vec![0; c.len()],
            (Shape::PerSubject(_), Shape::Pooled) => {
                return Err(CompileError::InvalidNode {
                    node: name.to_string(),
                    reason: format!(
                        "pooled node depends on per-subject node '{}'",
                        self.step_names[source]
                    ),
                })
            }
            (Shape::PerSubject(from), Shape::PerSubject(to)) => to
                .iter()
                .map(|subject| {
                    from.iter().position(|s| s == subject).ok_or_else(|| {
                        CompileError::MissingData {
                            node: self.step_names[source].clone(),
                            reason: format!("no value for subject {}", subject),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(Operand {
            value: source,
            rows,
        })
    }

    fn done(&self, id: NodeId) -> usize {
        match self.state.get(&id) {
            Some(Visit::Done(step)) => *step,
            _ => unreachable!("node was resolved before use"),
        }
    }

    fn free_parameter(&self, id: NodeId) -> Result<FreeParameter, CompileError> {
        let node = self.node(id)?;
        let (offset, shape) = self.free_layout[&id].clone();
        let density = match (self.roles[&id], node.prior, node.form) {
            (Role::FreePrior, Some(prior), _) => Density::Prior(prior),
            (Role::Population, _, NodeForm::Distribution(kind)) => {
                let args = self.graph.arguments(id);
                if args.len() != 2 {
                    return Err(CompileError::InvalidEdges {
                        node: node.name.clone(),
                        reason: format!(
                            "population distributions take 2 arguments, found {}",
                            args.len()
                        ),
                    });
                }
                let a = self.operand(self.done(args[0].child), &shape, &node.name)?;
                let b = self.operand(self.done(args[1].child), &shape, &node.name)?;
                Density::Population { kind, args: [a, b] }
            }
            _ => unreachable!("free nodes carry a prior or a distribution form"),
        };
        let subjects = match &shape {
            Shape::Pooled => None,
            Shape::PerSubject(subjects) => Some(subjects.clone()),
        };
        Ok(FreeParameter {
            node: id,
            name: node.name.clone(),
            offset,
            length: shape.len(),
            subjects,
            density,
        })
    }

    fn observed_output(&mut self, id: NodeId) -> Result<ObservedOutput, CompileError> {
        let graph = self.graph;
        let node = self.node(id)?;
        let NodeForm::Distribution(noise) = node.form else {
            unreachable!("observed nodes have a distribution form");
        };
        let args = graph.arguments(id);
        if args.len() != 2 {
            return Err(CompileError::InvalidEdges {
                node: node.name.clone(),
                reason: format!(
                    "observed outputs take a model output and a noise scale, found {} arguments",
                    args.len()
                ),
            });
        }
        let model_id = args[0].child;
        let output = args[0].name.clone().unwrap_or_else(|| node.name.clone());
        if !self.model.outputs().contains(&output) {
            return Err(CompileError::UnresolvedReference {
                node: node.name.clone(),
                name: output,
            });
        }

        let dataset = node.covariate.as_deref().unwrap_or_default();
        let subjects = self.series(&node.name, dataset)?.by_subject();
        let shape = Shape::PerSubject(subjects.iter().map(|s| s.subject).collect());

        let scale_step = self.visit(args[1].child)?;
        let scale = self.operand(scale_step, &shape, &node.name)?;
        let parameters = self.model_arguments(model_id, &shape)?;

        Ok(ObservedOutput {
            node: id,
            name: node.name.clone(),
            output,
            noise,
            subjects,
            scale,
            parameters,
        })
    }

    fn model_arguments(
        &mut self,
        model_id: NodeId,
        shape: &Shape,
    ) -> Result<Vec<ModelArgument>, CompileError> {
        let graph = self.graph;
        let model_node = self.node(model_id)?;
        let names = self.model.parameter_names();
        let defaults = self.model.default_parameters();
        if names.len() != defaults.len() {
            return Err(CompileError::InvalidNode {
                node: model_node.name.clone(),
                reason: format!(
                    "model declares {} parameters but {} defaults",
                    names.len(),
                    defaults.len()
                ),
            });
        }

        let mut arguments: Vec<ModelArgument> =
            defaults.into_iter().map(ModelArgument::Default).collect();
        for edge in graph.arguments(model_id) {
            let name = match &edge.name {
                Some(name) => name.clone(),
                None => self.node(edge.child)?.name.clone(),
            };
            let position = names.iter().position(|n| *n == name).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    node: model_node.name.clone(),
                    name: name.clone(),
                }
            })?;
            let step = self.visit(edge.child)?;
            arguments[position] = ModelArgument::Node(self.operand(step, shape, &model_node.name)?);
        }
        Ok(arguments)
    }

    /// Stored values where present, typical values of each density otherwise.
    fn initial_position(&self, program: &ValueProgram, free: &[FreeParameter], dim: usize) -> Vec<f64> {
        let by_offset: HashMap<usize, &FreeParameter> =
            free.iter().map(|p| (p.offset, p)).collect();
        let mut position = vec![0f64; dim];
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(program.steps.len());
        for step in &program.steps {
            let value = match step {
                Step::Free { offset, length } => {
                    let param = by_offset[offset];
                    let stored = self.graph.node(param.node).and_then(|n| n.value);
                    let init: Vec<f64> = (0..*length)
                        .map(|row| {
                            stored.unwrap_or_else(|| {
                                let (a, b) = param.density.args(&values, row);
                                typical_value(param.density.kind(), a, b)
                            })
                        })
                        .collect();
                    position[*offset..offset + length].copy_from_slice(&init);
                    init
                }
                Step::Fixed(v) => v.clone(),
                Step::Equation {
                    expr,
                    inputs,
                    length,
                } => (0..*length)
                    .map(|row| {
                        let args: Vec<f64> = inputs.iter().map(|op| op.get(&values, row)).collect();
                        expr.eval(&args)
                    })
                    .collect(),
            };
            values.push(value);
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        covariate::InMemoryCovariates,
        graph::Prior,
        model::test_models::OneCompartment,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn data() -> InMemoryCovariates {
        InMemoryCovariates::new()
            .with(
                "conc",
                Series {
                    times: vec![0.5, 1.0, 0.5, 2.0],
                    values: vec![9.0, 8.1, 7.5, 5.0],
                    subjects: vec![1, 1, 2, 2],
                },
            )
            .with(
                "WT",
                Series {
                    times: vec![0.0, 0.0],
                    values: vec![70.0, 35.0],
                    subjects: vec![1, 2],
                },
            )
    }

    /// CL has a prior, V is per subject with a population distribution whose
    /// mean is free and whose sd is fixed, sigma is an equation.
    fn hierarchical() -> ParameterGraph {
        let mut g = ParameterGraph::new();
        let obs = g.add_node(
            LikelihoodNode::distribution("conc_obs", DistributionKind::Normal).with_covariate("conc"),
        );
        let pk = g.add_node(LikelihoodNode::model("pk"));
        let cl = g.add_node(LikelihoodNode::fixed("CL", 2.0).with_prior(Prior::log_normal(0.5, 1.0)));
        let v = g.add_node(
            LikelihoodNode::distribution("V", DistributionKind::LogNormal).per_subject("conc"),
        );
        let v_pop = g.add_node(
            LikelihoodNode::fixed("V_pop", 2.3).with_prior(Prior::normal(2.3, 1.0)),
        );
        let omega = g.add_node(LikelihoodNode::fixed("omega", 0.2));
        let sigma = g.add_node(LikelihoodNode::equation("sigma", "0.05 * 2"));
        g.connect_named(obs, pk, 0, "central.conc").unwrap();
        g.connect(obs, sigma, 1).unwrap();
        g.connect(pk, cl, 0).unwrap();
        g.connect(pk, v, 1).unwrap();
        g.connect(v, v_pop, 0).unwrap();
        g.connect(v, omega, 1).unwrap();
        g
    }

    #[test]
    fn splits_fixed_and_free() {
        let run = compile(&hierarchical(), &OneCompartment::default(), &data()).unwrap();

        let names: Vec<&str> = run.free.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["CL", "V", "V_pop"]);
        assert_eq!(run.dim(), 1 + 2 + 1);
        assert_eq!(run.free[1].subjects, Some(vec![1, 2]));
        assert_eq!(run.free[1].range(), 1..3);

        assert_eq!(run.fixed_value("omega"), Some(0.2));
        assert_relative_eq!(run.fixed_value("sigma").unwrap(), 0.1);
        assert!(!run.fixed.contains_key("CL"));
        assert_eq!(run.outputs.len(), 1);
        assert_eq!(run.outputs[0].output, "central.conc");
        assert_eq!(run.outputs[0].subjects.len(), 2);
    }

    #[test]
    fn initial_values_use_stored_values_then_typical_values() {
        let run = compile(&hierarchical(), &OneCompartment::default(), &data()).unwrap();
        // CL stored value, V typical value exp(V_pop), V_pop stored value
        assert_relative_eq!(run.initial[0], 2.0);
        assert_relative_eq!(run.initial[1], 2.3f64.exp());
        assert_relative_eq!(run.initial[2], 2.3f64.exp());
        assert_relative_eq!(run.initial[3], 2.3);
    }

    #[test]
    fn index_maps_round_trip() {
        let run = compile(&hierarchical(), &OneCompartment::default(), &data()).unwrap();
        for param in &run.free {
            let start = run.index.graph_to_vector(&param.name).unwrap();
            assert_eq!(run.index.vector_to_graph(start).unwrap().name, param.name);
        }
    }

    #[test]
    fn compiling_twice_is_identical() {
        let graph = hierarchical();
        let a = compile(&graph, &OneCompartment::default(), &data()).unwrap();
        let b = compile(&graph, &OneCompartment::default(), &data()).unwrap();
        assert_eq!(a.fixed, b.fixed);
        assert_eq!(a.free, b.free);
        assert_eq!(a.index, b.index);
        assert_eq!(a.initial, b.initial);
    }

    #[test]
    fn duplicate_names_are_rejected_first() {
        let mut g = hierarchical();
        g.add_node(LikelihoodNode::fixed("omega", 1.0));
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert_eq!(err, CompileError::DuplicateName("omega".into()));
    }

    #[test]
    fn equations_resolve_covariates_per_subject() {
        let mut g = hierarchical();
        let cl = g.find("CL").unwrap();
        g.node_mut(cl).unwrap().prior = None;
        g.node_mut(cl).unwrap().form = NodeForm::Equation;
        g.node_mut(cl).unwrap().expression = Some("CL_pop * (WT / 70) ^ 0.75".into());
        g.add_node(LikelihoodNode::fixed("CL_pop", 3.0));

        let run = compile(&g, &OneCompartment::default(), &data()).unwrap();
        let cl = &run.equations["CL"];
        assert_eq!(cl.len(), 2);
        assert_relative_eq!(cl[0], 3.0);
        assert_relative_eq!(cl[1], 3.0 * 0.5f64.powf(0.75));
        // only fixed inputs, so it is fixed too
        assert_eq!(run.fixed["CL"], *cl);
    }

    #[test]
    fn equations_over_free_parameters_are_not_fixed() {
        let mut g = hierarchical();
        let sigma = g.find("sigma").unwrap();
        g.node_mut(sigma).unwrap().expression = Some("CL / 20".into());
        let run = compile(&g, &OneCompartment::default(), &data()).unwrap();
        assert!(!run.fixed.contains_key("sigma"));
        assert_relative_eq!(run.equations["sigma"][0], 0.1);
    }

    #[test]
    fn unresolved_reference() {
        let mut g = hierarchical();
        let sigma = g.find("sigma").unwrap();
        g.node_mut(sigma).unwrap().expression = Some("nope * 2".into());
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedReference {
                node: "sigma".into(),
                name: "nope".into()
            }
        );
    }

    #[test]
    fn equation_cycles_are_detected() {
        let mut g = hierarchical();
        let sigma = g.find("sigma").unwrap();
        g.node_mut(sigma).unwrap().expression = Some("tau * 2".into());
        g.add_node(LikelihoodNode::equation("tau", "sigma / 2"));
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::Cycle(_)));

        let mut g = hierarchical();
        let sigma = g.find("sigma").unwrap();
        g.node_mut(sigma).unwrap().expression = Some("sigma + 1".into());
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert_eq!(err, CompileError::Cycle("sigma".into()));
    }

    #[test]
    fn per_subject_nodes_need_data() {
        let mut g = hierarchical();
        let v = g.find("V").unwrap();
        g.node_mut(v).unwrap().covariate = Some("missing".into());
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::MissingData { ref node, .. } if node == "V"));

        let mut g = hierarchical();
        let v = g.find("V").unwrap();
        g.node_mut(v).unwrap().length = Some(5);
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidNode { .. }));
    }

    #[test]
    fn declared_edge_lengths_must_match_expansions() {
        use crate::graph::ParameterEdge;

        let graph = |v_length: Option<usize>, model_length: Option<usize>| {
            let mut g = ParameterGraph::new();
            let obs = g.add_node(
                LikelihoodNode::distribution("conc_obs", DistributionKind::Normal)
                    .with_covariate("conc"),
            );
            let pk = g.add_node(LikelihoodNode::model("pk"));
            let v = g.add_node(
                LikelihoodNode::fixed("V", 10.0)
                    .with_prior(Prior::log_normal(2.3, 0.5))
                    .per_subject("conc"),
            );
            let sigma = g.add_node(LikelihoodNode::fixed("sigma", 0.1));
            g.add_edge(ParameterEdge {
                parent: obs,
                child: pk,
                parent_index: 0,
                name: Some("central.conc".into()),
                length: model_length,
            })
            .unwrap();
            g.add_edge(ParameterEdge {
                parent: obs,
                child: sigma,
                parent_index: 1,
                name: None,
                length: Some(1),
            })
            .unwrap();
            g.add_edge(ParameterEdge {
                parent: pk,
                child: v,
                parent_index: 0,
                name: None,
                length: v_length,
            })
            .unwrap();
            g
        };
        let model = OneCompartment::default();

        let run = compile(&graph(Some(2), None), &model, &data()).unwrap();
        assert_eq!(run.dim(), 2);
        assert!(compile(&graph(None, None), &model, &data()).is_ok());

        let err = compile(&graph(Some(3), None), &model, &data()).unwrap_err();
        assert_eq!(
            err,
            CompileError::InvalidEdges {
                node: "pk".into(),
                reason: "argument 'V' declares length 3 but expands to 2".into(),
            }
        );
        let err = compile(&graph(Some(2), Some(1)), &model, &data()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidEdges { ref node, .. } if node == "conc_obs"));
    }

    #[test]
    fn observed_subjects_must_have_parameter_values() {
        let covariates = data().with(
            "few",
            Series {
                times: vec![0.0],
                values: vec![1.0],
                subjects: vec![1],
            },
        );
        let mut g = hierarchical();
        let v = g.find("V").unwrap();
        g.node_mut(v).unwrap().covariate = Some("few".into());
        let err = compile(&g, &OneCompartment::default(), &covariates).unwrap_err();
        assert!(matches!(err, CompileError::MissingData { .. }));
    }

    #[test]
    fn no_observed_outputs() {
        let mut g = hierarchical();
        let obs = g.find("conc_obs").unwrap();
        g.remove_node(obs);
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert_eq!(err, CompileError::NoObservedOutputs);
    }

    #[test]
    fn unknown_model_output_or_parameter() {
        let mut g = hierarchical();
        let obs = g.find("conc_obs").unwrap();
        let pk = g.find("pk").unwrap();
        let sigma = g.find("sigma").unwrap();
        g.remove_node(obs);
        let obs = g.add_node(
            LikelihoodNode::distribution("conc_obs", DistributionKind::Normal).with_covariate("conc"),
        );
        g.connect_named(obs, pk, 0, "peripheral.conc").unwrap();
        g.connect(obs, sigma, 1).unwrap();
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedReference { ref name, .. } if name == "peripheral.conc"));

        let mut g = hierarchical();
        let pk = g.find("pk").unwrap();
        let ka = g.add_node(LikelihoodNode::fixed("ka", 1.0));
        g.connect(pk, ka, 2).unwrap();
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedReference { ref name, .. } if name == "ka"));
    }

    #[test]
    fn priors_on_equations_are_invalid() {
        let mut g = hierarchical();
        let sigma = g.find("sigma").unwrap();
        g.node_mut(sigma).unwrap().prior = Some(Prior::normal(0.0, 1.0));
        let err = compile(&g, &OneCompartment::default(), &data()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidNode { .. }));
    }
}
