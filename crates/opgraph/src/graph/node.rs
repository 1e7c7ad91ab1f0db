use std::fmt;

use serde::{Deserialize, Serialize};

use super::nodes::{
    arithmetic, concat, convolution, dequantize, flatten, reverse, strided_slice,
    StridedSliceParams,
};
use super::visitor::NodeVisitor;
use super::{NodeId, TensorId};
use crate::error::{GraphError, Result};
use crate::ops::{ActivationFunction, ConvInfo, ElementwiseOp};
use crate::tensor::{DataType, HostTensor, TensorDescriptor};

/// Operator carried by a node, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Graph input; data is supplied by the caller before each run.
    Input { desc: TensorDescriptor },
    /// Constant tensor copied into its buffer once, when the plan is built.
    Const { tensor: HostTensor },
    /// Marks its single input as a graph result.
    Output,
    Flatten,
    StridedSlice(StridedSliceParams),
    DepthConcatenate,
    Activation(ActivationFunction),
    Elementwise {
        op: ElementwiseOp,
        activation: Option<ActivationFunction>,
    },
    MatMul {
        activation: Option<ActivationFunction>,
    },
    /// Inputs: source, weights and an optional bias.
    Convolution(ConvInfo),
    Reverse {
        axes: Vec<usize>,
        use_inverted_axis: bool,
    },
    Dequantize { output_type: DataType },
}

/// Parameter-free tag of a [`NodeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Input,
    Const,
    Output,
    Flatten,
    StridedSlice,
    DepthConcatenate,
    Activation,
    Elementwise,
    MatMul,
    Convolution,
    Reverse,
    Dequantize,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Input => "input",
            NodeType::Const => "const",
            NodeType::Output => "output",
            NodeType::Flatten => "flatten",
            NodeType::StridedSlice => "strided_slice",
            NodeType::DepthConcatenate => "depth_concatenate",
            NodeType::Activation => "activation",
            NodeType::Elementwise => "elementwise",
            NodeType::MatMul => "matmul",
            NodeType::Convolution => "convolution",
            NodeType::Reverse => "reverse",
            NodeType::Dequantize => "dequantize",
        };
        f.write_str(name)
    }
}

/// Accepted number of input slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    Between(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::Between(lo, hi) => (lo..=hi).contains(&count),
            Arity::AtLeast(n) => count >= n,
        }
    }
}

/// Descriptor propagation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// At least one input slot is unbound.
    Unconfigured,
    /// Inputs bound; output descriptors not derived (or invalidated).
    DescriptorsPending,
    DescriptorsResolved,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Input { .. } => NodeType::Input,
            NodeKind::Const { .. } => NodeType::Const,
            NodeKind::Output => NodeType::Output,
            NodeKind::Flatten => NodeType::Flatten,
            NodeKind::StridedSlice(_) => NodeType::StridedSlice,
            NodeKind::DepthConcatenate => NodeType::DepthConcatenate,
            NodeKind::Activation(_) => NodeType::Activation,
            NodeKind::Elementwise { .. } => NodeType::Elementwise,
            NodeKind::MatMul { .. } => NodeType::MatMul,
            NodeKind::Convolution(_) => NodeType::Convolution,
            NodeKind::Reverse { .. } => NodeType::Reverse,
            NodeKind::Dequantize { .. } => NodeType::Dequantize,
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            NodeKind::Input { .. } | NodeKind::Const { .. } => Arity::Exactly(0),
            NodeKind::DepthConcatenate => Arity::AtLeast(1),
            NodeKind::Elementwise { .. } | NodeKind::MatMul { .. } => Arity::Exactly(2),
            NodeKind::Convolution(_) => Arity::Between(2, 3),
            NodeKind::Output
            | NodeKind::Flatten
            | NodeKind::StridedSlice(_)
            | NodeKind::Activation(_)
            | NodeKind::Reverse { .. }
            | NodeKind::Dequantize { .. } => Arity::Exactly(1),
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            NodeKind::Output => 0,
            _ => 1,
        }
    }

    /// Activation fused into this node, for kinds that accept one.
    pub fn fused_activation(&self) -> Option<ActivationFunction> {
        match self {
            NodeKind::Elementwise { activation, .. } | NodeKind::MatMul { activation } => *activation,
            NodeKind::Convolution(info) => info.activation,
            _ => None,
        }
    }

    /// Installs a fused activation; returns `false` for kinds that cannot carry one.
    pub fn fuse_activation(&mut self, function: ActivationFunction) -> bool {
        match self {
            NodeKind::Elementwise { activation, .. } | NodeKind::MatMul { activation } => {
                *activation = Some(function);
                true
            }
            NodeKind::Convolution(info) => {
                info.activation = Some(function);
                true
            }
            _ => false,
        }
    }
}

/// Graph vertex: an operator plus its input slots and output tensors.
#[derive(Debug, Clone)]
pub struct Node {
    pub(super) id: NodeId,
    pub(super) name: Option<String>,
    pub(super) kind: NodeKind,
    pub(super) inputs: Vec<Option<TensorId>>,
    pub(super) outputs: Vec<TensorId>,
    pub(super) enabled: bool,
    pub(super) state: NodeState,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name used in diagnostics: the given name, else `type#id`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}#{}", self.node_type(), self.id.0),
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn inputs(&self) -> &[Option<TensorId>] {
        &self.inputs
    }

    pub fn input(&self, slot: usize) -> Option<TensorId> {
        self.inputs.get(slot).copied().flatten()
    }

    /// Bound inputs in slot order; `None` while any slot is empty.
    pub fn bound_inputs(&self) -> Option<Vec<TensorId>> {
        self.inputs.iter().copied().collect()
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn output(&self, index: usize) -> Option<TensorId> {
        self.outputs.get(index).copied()
    }

    /// Disabled nodes keep their place in the graph but execute nothing.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Derives the descriptor of output `index` from the input descriptors.
    pub fn configure_output(
        &self,
        index: usize,
        inputs: &[&TensorDescriptor],
    ) -> Result<TensorDescriptor> {
        if index >= self.kind.num_outputs() {
            return Err(GraphError::invalid_argument(format!(
                "{} has no output {index}",
                self.label()
            )));
        }
        if !self.kind.arity().accepts(inputs.len()) {
            return Err(GraphError::shape_mismatch(
                self.label(),
                format!("{} inputs do not satisfy {:?}", inputs.len(), self.kind.arity()),
            ));
        }
        let out = match &self.kind {
            NodeKind::Input { desc } => Ok(desc.clone()),
            NodeKind::Const { tensor } => Ok(tensor.desc.clone()),
            NodeKind::Output => Err(GraphError::invalid_argument("output nodes produce no tensors")),
            NodeKind::Flatten => flatten::compute_output_descriptor(inputs[0]),
            NodeKind::StridedSlice(params) => {
                strided_slice::compute_output_descriptor(inputs[0], params)
            }
            NodeKind::DepthConcatenate => concat::compute_output_descriptor(inputs),
            NodeKind::Activation(_) => arithmetic::activation_output(inputs[0]),
            NodeKind::Elementwise { op, .. } => {
                arithmetic::elementwise_output(*op, inputs[0], inputs[1])
            }
            NodeKind::MatMul { .. } => arithmetic::matmul_output(inputs[0], inputs[1]),
            NodeKind::Convolution(info) => convolution::compute_output_descriptor(
                inputs[0],
                inputs[1],
                inputs.get(2).copied(),
                info,
            ),
            NodeKind::Reverse {
                axes,
                use_inverted_axis,
            } => reverse::compute_output_descriptor(inputs[0], axes, *use_inverted_axis),
            NodeKind::Dequantize { output_type } => {
                dequantize::compute_output_descriptor(inputs[0], *output_type)
            }
        };
        out.map_err(|err| err.at_node(self.label()))
    }

    /// Double-dispatches into the visitor method for this node's type.
    pub fn accept(&self, visitor: &mut dyn NodeVisitor) {
        match self.node_type() {
            NodeType::Input => visitor.visit_input(self),
            NodeType::Const => visitor.visit_const(self),
            NodeType::Output => visitor.visit_output(self),
            NodeType::Flatten => visitor.visit_flatten(self),
            NodeType::StridedSlice => visitor.visit_strided_slice(self),
            NodeType::DepthConcatenate => visitor.visit_depth_concatenate(self),
            NodeType::Activation => visitor.visit_activation(self),
            NodeType::Elementwise => visitor.visit_elementwise(self),
            NodeType::MatMul => visitor.visit_matmul(self),
            NodeType::Convolution => visitor.visit_convolution(self),
            NodeType::Reverse => visitor.visit_reverse(self),
            NodeType::Dequantize => visitor.visit_dequantize(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_ranges() {
        assert!(Arity::Between(2, 3).accepts(3));
        assert!(!Arity::Between(2, 3).accepts(1));
        assert!(Arity::AtLeast(1).accepts(9));
        assert!(!Arity::Exactly(0).accepts(1));
    }

    #[test]
    fn fusion_only_applies_to_producers_with_epilogues() {
        let mut conv = NodeKind::Convolution(ConvInfo::default());
        assert!(conv.fuse_activation(ActivationFunction::Relu));
        assert_eq!(conv.fused_activation(), Some(ActivationFunction::Relu));
        let mut flatten = NodeKind::Flatten;
        assert!(!flatten.fuse_activation(ActivationFunction::Relu));
    }
}
