//! Fluent front end that adds nodes, wires them and propagates descriptors eagerly.

use super::node::NodeKind;
use super::nodes::StridedSliceParams;
use super::store::Graph;
use super::{NodeId, TensorId};
use crate::error::{GraphError, Result};
use crate::ops::{ActivationFunction, ConvInfo, ElementwiseOp};
use crate::tensor::{DataType, HostTensor, TensorDescriptor};

/// Stages nodes into a [`Graph`].
///
/// Every helper connects its operands and forwards descriptors immediately, so
/// shape errors surface at the call that introduced them.
pub struct GraphBuilder {
    graph: Graph,
    pending_name: Option<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            graph: Graph::new(name),
            pending_name: None,
        }
    }

    /// Names the next node added through the builder.
    pub fn named(&mut self, name: impl Into<String>) -> &mut Self {
        self.pending_name = Some(name.into());
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    pub fn input(&mut self, desc: TensorDescriptor) -> Result<TensorId> {
        self.emit(NodeKind::Input { desc }, &[])
    }

    pub fn constant(&mut self, tensor: HostTensor) -> Result<TensorId> {
        self.emit(NodeKind::Const { tensor }, &[])
    }

    /// Marks `tensor` as a graph result.
    pub fn output(&mut self, tensor: TensorId) -> Result<NodeId> {
        let id = self.add(NodeKind::Output, &[tensor])?;
        self.graph.forward_node(id)?;
        Ok(id)
    }

    pub fn flatten(&mut self, x: TensorId) -> Result<TensorId> {
        self.emit(NodeKind::Flatten, &[x])
    }

    pub fn strided_slice(&mut self, x: TensorId, params: StridedSliceParams) -> Result<TensorId> {
        self.emit(NodeKind::StridedSlice(params), &[x])
    }

    pub fn depth_concatenate(&mut self, inputs: &[TensorId]) -> Result<TensorId> {
        self.emit(NodeKind::DepthConcatenate, inputs)
    }

    pub fn activation(&mut self, x: TensorId, function: ActivationFunction) -> Result<TensorId> {
        self.emit(NodeKind::Activation(function), &[x])
    }

    pub fn elementwise(&mut self, op: ElementwiseOp, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.emit(
            NodeKind::Elementwise {
                op,
                activation: None,
            },
            &[lhs, rhs],
        )
    }

    pub fn matmul(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.emit(NodeKind::MatMul { activation: None }, &[lhs, rhs])
    }

    pub fn convolution(
        &mut self,
        x: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        info: ConvInfo,
    ) -> Result<TensorId> {
        let mut inputs = vec![x, weights];
        inputs.extend(bias);
        self.emit(NodeKind::Convolution(info), &inputs)
    }

    pub fn reverse(&mut self, x: TensorId, axes: &[usize], use_inverted_axis: bool) -> Result<TensorId> {
        self.emit(
            NodeKind::Reverse {
                axes: axes.to_vec(),
                use_inverted_axis,
            },
            &[x],
        )
    }

    pub fn dequantize(&mut self, x: TensorId, output_type: DataType) -> Result<TensorId> {
        self.emit(NodeKind::Dequantize { output_type }, &[x])
    }

    fn emit(&mut self, kind: NodeKind, inputs: &[TensorId]) -> Result<TensorId> {
        let id = self.add(kind, inputs)?;
        self.graph.forward_node(id)?;
        let node = self.graph.node(id)?;
        node.output(0).ok_or_else(|| {
            GraphError::invalid_argument(format!("{} has no output", node.label()))
        })
    }

    fn add(&mut self, kind: NodeKind, inputs: &[TensorId]) -> Result<NodeId> {
        let id = self.graph.add_node(kind, inputs.len())?;
        if let Some(name) = self.pending_name.take() {
            self.graph.set_node_name(id, name)?;
        }
        for (slot, tensor) in inputs.iter().enumerate() {
            self.graph.connect(*tensor, id, slot)?;
        }
        Ok(id)
    }
}
