//! Operator graphs over tensor kernels.
//!
//! A [`graph::Graph`] of typed operator nodes is rewritten by
//! [`mutators`], then finalized into a [`runtime::ExecutionPlan`]: storage is
//! allocated once and every node is bound to a kernel chosen from a
//! [`kernels::KernelRegistry`] for the host's [`kernels::Capabilities`].
//! Kernel bodies are supplied by backend crates.

pub mod config;
pub mod error;
pub mod functions;
pub mod graph;
pub mod kernels;
pub mod mutators;
pub mod ops;
pub mod runtime;
pub mod tensor;

mod env;

pub use config::{ExecutionMode, GraphConfig, MutatorSelection};
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphBuilder, NodeId, TensorId};
pub use tensor::{DataLayout, DataType, HostTensor, Shape, TensorDescriptor};
