//! The flat vector layout of a compiled run.

use std::{collections::HashMap, ops::Range};

use serde::{Deserialize, Serialize};

use crate::{
    error::DimensionMismatch,
    graph::{DistributionKind, NodeId, Prior},
};

/// A reference to the value of a compiled node, aligned to the rows of its
/// consumer.
///
/// `rows[i]` is the element of the source value used for row `i` of the
/// consumer. Pooled sources always map to element 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub(crate) value: usize,
    pub(crate) rows: Vec<usize>,
}

impl Operand {
    pub(crate) fn get(&self, values: &[Vec<f64>], row: usize) -> f64 {
        values[self.value][self.rows[row]]
    }
}

/// Where the density of a free parameter comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Density {
    /// A fixed prior attached to the node.
    Prior(Prior),
    /// A population distribution whose arguments are other nodes.
    Population {
        kind: DistributionKind,
        args: [Operand; 2],
    },
}

impl Density {
    pub fn kind(&self) -> DistributionKind {
        match self {
            Density::Prior(prior) => prior.kind,
            Density::Population { kind, .. } => *kind,
        }
    }

    /// The two distribution arguments for element `row`.
    pub(crate) fn args(&self, values: &[Vec<f64>], row: usize) -> (f64, f64) {
        match self {
            Density::Prior(prior) => (prior.params[0], prior.params[1]),
            Density::Population { args, .. } => (args[0].get(values, row), args[1].get(values, row)),
        }
    }
}

/// A node whose value is inferred, expanded into `length` vector slots.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeParameter {
    pub node: NodeId,
    pub name: String,
    pub offset: usize,
    pub length: usize,
    /// Subject identifiers of the slots of a per-subject parameter.
    pub subjects: Option<Vec<u64>>,
    pub density: Density,
}

impl FreeParameter {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }
}

/// One element of the flat parameter vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub name: String,
    pub element: usize,
}

/// Bidirectional lookup between graph names and vector positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterIndex {
    slots: Vec<SlotKey>,
    ranges: HashMap<String, Range<usize>>,
}

impl ParameterIndex {
    pub(crate) fn from_free(free: &[FreeParameter]) -> Self {
        let mut slots = Vec::new();
        let mut ranges = HashMap::new();
        for param in free {
            debug_assert_eq!(param.offset, slots.len());
            slots.extend((0..param.length).map(|element| SlotKey {
                name: param.name.clone(),
                element,
            }));
            ranges.insert(param.name.clone(), param.range());
        }
        Self { slots, ranges }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The first vector position of `name`.
    pub fn graph_to_vector(&self, name: &str) -> Option<usize> {
        self.ranges.get(name).map(|r| r.start)
    }

    pub fn range(&self, name: &str) -> Option<Range<usize>> {
        self.ranges.get(name).cloned()
    }

    pub fn position(&self, key: &SlotKey) -> Option<usize> {
        self.ranges
            .get(&key.name)
            .filter(|r| key.element < r.len())
            .map(|r| r.start + key.element)
    }

    pub fn vector_to_graph(&self, position: usize) -> Option<&SlotKey> {
        self.slots.get(position)
    }

    pub fn slots(&self) -> &[SlotKey] {
        &self.slots
    }

    /// Pair every element of `vector` with its slot.
    pub fn label<'a>(
        &'a self,
        vector: &'a [f64],
    ) -> Result<impl Iterator<Item = (&'a SlotKey, f64)> + 'a, DimensionMismatch> {
        self.check_len(vector)?;
        Ok(self.slots.iter().zip(vector.iter().copied()))
    }

    pub fn check_len(&self, vector: &[f64]) -> Result<(), DimensionMismatch> {
        if vector.len() != self.slots.len() {
            return Err(DimensionMismatch {
                expected: self.slots.len(),
                got: vector.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, offset: usize, length: usize) -> FreeParameter {
        FreeParameter {
            node: NodeId(offset as u32),
            name: name.to_string(),
            offset,
            length,
            subjects: None,
            density: Density::Prior(Prior::normal(0.0, 1.0)),
        }
    }

    #[test]
    fn expanded_parameters_take_consecutive_slots() {
        let index = ParameterIndex::from_free(&[param("a", 0, 1), param("b", 1, 3), param("c", 4, 1)]);
        assert_eq!(index.len(), 5);
        assert_eq!(index.graph_to_vector("b"), Some(1));
        assert_eq!(index.range("b"), Some(1..4));
        assert_eq!(
            index.vector_to_graph(3),
            Some(&SlotKey {
                name: "b".into(),
                element: 2
            })
        );
        assert_eq!(index.graph_to_vector("missing"), None);
        assert_eq!(index.vector_to_graph(5), None);
    }

    #[test]
    fn position_checks_element_bounds() {
        let index = ParameterIndex::from_free(&[param("b", 0, 2)]);
        let inside = SlotKey {
            name: "b".into(),
            element: 1,
        };
        let outside = SlotKey {
            name: "b".into(),
            element: 2,
        };
        assert_eq!(index.position(&inside), Some(1));
        assert_eq!(index.position(&outside), None);
    }

    #[test]
    fn labels_need_a_matching_vector() {
        let index = ParameterIndex::from_free(&[param("a", 0, 1), param("b", 1, 2)]);
        let labelled: Vec<_> = index.label(&[1.0, 2.0, 3.0]).unwrap().collect();
        assert_eq!(labelled[2].0.name, "b");
        assert_eq!(labelled[2].1, 3.0);
        assert_eq!(
            index.label(&[1.0]).err(),
            Some(DimensionMismatch {
                expected: 3,
                got: 1
            })
        );
    }
}
