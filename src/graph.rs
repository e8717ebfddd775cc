//! The declarative parameter graph of one inference run.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Edges are kept in a
//! flat list and refer to nodes by id only, so a node can be an argument of one
//! parent while having arguments of its own without any ownership cycles.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// Opaque handle of a node inside a [`ParameterGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionKind {
    /// Arguments: mean, standard deviation.
    Normal,
    /// Arguments: mean and standard deviation of the logarithm.
    LogNormal,
    /// Arguments: lower and upper bound.
    Uniform,
}

/// What a node computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeForm {
    Fixed,
    Equation,
    /// Wraps the forward-simulation capability.
    Model,
    /// A prior, population or observation-noise distribution.
    Distribution(DistributionKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Pooling {
    /// One value shared by all subjects.
    #[default]
    Pooled,
    /// One value per subject of the node's covariate dataset.
    PerSubject,
}

/// Marks a node as inferred and carries its prior distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub kind: DistributionKind,
    pub params: [f64; 2],
}

impl Prior {
    pub fn normal(mean: f64, sd: f64) -> Self {
        Self {
            kind: DistributionKind::Normal,
            params: [mean, sd],
        }
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Self {
        Self {
            kind: DistributionKind::LogNormal,
            params: [mu, sigma],
        }
    }

    pub fn uniform(lower: f64, upper: f64) -> Self {
        Self {
            kind: DistributionKind::Uniform,
            params: [lower, upper],
        }
    }
}

/// One quantity in the probability model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodNode {
    pub name: String,
    pub form: NodeForm,
    pub value: Option<f64>,
    pub expression: Option<String>,
    /// Name of the external covariate or observation dataset bound to this node.
    pub covariate: Option<String>,
    pub pooling: Pooling,
    pub length: Option<usize>,
    pub prior: Option<Prior>,
}

impl LikelihoodNode {
    fn new(name: impl Into<String>, form: NodeForm) -> Self {
        Self {
            name: name.into(),
            form,
            value: None,
            expression: None,
            covariate: None,
            pooling: Pooling::Pooled,
            length: None,
            prior: None,
        }
    }

    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self {
            value: Some(value),
            ..Self::new(name, NodeForm::Fixed)
        }
    }

    pub fn equation(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            ..Self::new(name, NodeForm::Equation)
        }
    }

    pub fn model(name: impl Into<String>) -> Self {
        Self::new(name, NodeForm::Model)
    }

    pub fn distribution(name: impl Into<String>, kind: DistributionKind) -> Self {
        Self::new(name, NodeForm::Distribution(kind))
    }

    /// Turn the node into a free parameter.
    pub fn with_prior(mut self, prior: Prior) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_covariate(mut self, dataset: impl Into<String>) -> Self {
        self.covariate = Some(dataset.into());
        self
    }

    /// One value per subject of `dataset`.
    pub fn per_subject(mut self, dataset: impl Into<String>) -> Self {
        self.pooling = Pooling::PerSubject;
        self.covariate = Some(dataset.into());
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }
}

/// A directed edge from a parent node to one of its argument nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterEdge {
    pub parent: NodeId,
    pub child: NodeId,
    /// Argument position of `child` in `parent`.
    pub parent_index: usize,
    pub name: Option<String>,
    /// Declared element count of `child`, checked against its expansion
    /// when the graph is compiled.
    pub length: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterGraph {
    nodes: Vec<Option<LikelihoodNode>>,
    edges: Vec<ParameterEdge>,
}

impl ParameterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Names are not checked here, the compiler rejects duplicates.
    pub fn add_node(&mut self, node: LikelihoodNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    /// Connect `child` as argument `parent_index` of `parent`.
    pub fn connect(
        &mut self,
        parent: NodeId,
        child: NodeId,
        parent_index: usize,
    ) -> Result<(), CompileError> {
        self.add_edge(ParameterEdge {
            parent,
            child,
            parent_index,
            name: None,
            length: None,
        })
    }

    /// Like [`Self::connect`], labelling the argument with `name`.
    pub fn connect_named(
        &mut self,
        parent: NodeId,
        child: NodeId,
        parent_index: usize,
        name: impl Into<String>,
    ) -> Result<(), CompileError> {
        self.add_edge(ParameterEdge {
            parent,
            child,
            parent_index,
            name: Some(name.into()),
            length: None,
        })
    }

    pub fn add_edge(&mut self, edge: ParameterEdge) -> Result<(), CompileError> {
        let Some(parent) = self.node(edge.parent) else {
            return Err(CompileError::InvalidEdges {
                node: format!("#{}", edge.parent.0),
                reason: "parent node does not exist".to_string(),
            });
        };
        if self.node(edge.child).is_none() {
            return Err(CompileError::InvalidEdges {
                node: parent.name.clone(),
                reason: format!("argument node #{} does not exist", edge.child.0),
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Delete a node together with every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<LikelihoodNode> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.edges.retain(|e| e.parent != id && e.child != id);
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&LikelihoodNode> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut LikelihoodNode> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|(_, n)| n.name == name).map(|(id, _)| id)
    }

    /// Live nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &LikelihoodNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    pub fn edges(&self) -> &[ParameterEdge] {
        &self.edges
    }

    /// The arguments of `parent`, ordered by argument position.
    pub fn arguments(&self, parent: NodeId) -> Vec<&ParameterEdge> {
        self.edges
            .iter()
            .filter(|e| e.parent == parent)
            .sorted_by_key(|e| e.parent_index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that every parent's argument positions are exactly `0..arity`.
    pub fn validate_edges(&self) -> Result<(), CompileError> {
        for (id, node) in self.nodes() {
            let args = self.arguments(id);
            for (expected, edge) in args.iter().enumerate() {
                if edge.parent_index != expected {
                    return Err(CompileError::InvalidEdges {
                        node: node.name.clone(),
                        reason: format!(
                            "argument positions must be contiguous from 0, found {} at position {}",
                            edge.parent_index, expected
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
