use thiserror::Error;

use crate::graph::{NodeId, TensorId};
use crate::ops::OpKind;

/// Errors raised while building, mutating, configuring or running a graph.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// Malformed parameters: zero stride, rank mismatch, negative counts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Descriptor propagation found incompatible input shapes or types.
    #[error("shape mismatch at {node}: {reason}")]
    ShapeMismatch { node: String, reason: String },

    /// No registered kernel variant accepts the requested configuration.
    #[error("unsupported configuration for {op:?}: {reason}")]
    UnsupportedConfiguration { op: OpKind, reason: String },

    #[error("connecting {tensor:?} into {node:?} would create a cycle")]
    Cycle { tensor: TensorId, node: NodeId },

    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("unknown tensor {0:?}")]
    UnknownTensor(TensorId),

    #[error("stale buffer handle (index {index}, generation {generation})")]
    StaleHandle { index: usize, generation: u32 },

    #[error("execution failure: {0}")]
    Execution(String),
}

impl GraphError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        GraphError::InvalidArgument(message.into())
    }

    pub fn shape_mismatch(node: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphError::ShapeMismatch {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(op: OpKind, reason: impl Into<String>) -> Self {
        GraphError::UnsupportedConfiguration {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        GraphError::Execution(message.into())
    }

    /// Attributes a shape mismatch raised by a descriptor helper to `node`.
    pub fn at_node(self, node: impl Into<String>) -> Self {
        match self {
            GraphError::ShapeMismatch { reason, .. } => GraphError::ShapeMismatch {
                node: node.into(),
                reason,
            },
            other => other,
        }
    }

    /// Returns `true` for errors reported by a `validate` dry-run.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, GraphError::UnsupportedConfiguration { .. })
    }
}

/// Convenience alias for results returned across the crate.
pub type Result<T> = std::result::Result<T, GraphError>;
