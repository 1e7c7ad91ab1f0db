//! Operator graph: typed nodes, graph-level tensors and descriptor propagation.
//!
//! A [`Graph`] owns its nodes and tensors. Nodes reference tensors by
//! [`TensorId`] through ordered input slots and output lists; tensors record
//! their producer, their consumers and how their storage is bound
//! ([`TensorBinding`]). Mutators rewrite bindings and topology, and
//! [`Graph::forward_descriptors`] re-derives output descriptors afterwards.

mod builder;
mod node;
pub mod nodes;
mod store;
mod visitor;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::GraphBuilder;
pub use node::{Arity, Node, NodeKind, NodeState, NodeType};
pub use store::{Graph, TensorBinding, TensorEntry};
pub use visitor::{GraphPrinter, NodeVisitor};

/// Stable identifier of a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Stable identifier of a graph-level tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}
