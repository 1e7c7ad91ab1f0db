//! Operation parameters shared by graph nodes, functions and kernels.

use serde::{Deserialize, Serialize};

/// Activation applied standalone or fused into a producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActivationFunction {
    Identity,
    Relu,
    /// `min(upper, max(0, x))`
    BoundedRelu { upper: f32 },
    /// `min(upper, max(lower, x))`
    LuBoundedRelu { upper: f32, lower: f32 },
    Logistic,
    Tanh,
}

impl ActivationFunction {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationFunction::Identity => x,
            ActivationFunction::Relu => x.max(0.0),
            ActivationFunction::BoundedRelu { upper } => x.max(0.0).min(upper),
            ActivationFunction::LuBoundedRelu { upper, lower } => x.max(lower).min(upper),
            ActivationFunction::Logistic => 1.0 / (1.0 + (-x).exp()),
            ActivationFunction::Tanh => x.tanh(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ActivationFunction::Identity => "identity",
            ActivationFunction::Relu => "relu",
            ActivationFunction::BoundedRelu { .. } => "brelu",
            ActivationFunction::LuBoundedRelu { .. } => "lu_brelu",
            ActivationFunction::Logistic => "logistic",
            ActivationFunction::Tanh => "tanh",
        }
    }
}

/// Binary elementwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Max,
    Min,
    /// Integer-only; operates on the raw bit patterns.
    BitwiseXor,
}

impl ElementwiseOp {
    pub fn apply_f32(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            ElementwiseOp::Add => lhs + rhs,
            ElementwiseOp::Sub => lhs - rhs,
            ElementwiseOp::Mul => lhs * rhs,
            ElementwiseOp::Max => lhs.max(rhs),
            ElementwiseOp::Min => lhs.min(rhs),
            ElementwiseOp::BitwiseXor => f32::from_bits(lhs.to_bits() ^ rhs.to_bits()),
        }
    }
}

/// Direct 2-D convolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvInfo {
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub activation: Option<ActivationFunction>,
}

impl ConvInfo {
    pub fn new(stride: (usize, usize), pad: (usize, usize, usize, usize)) -> Self {
        Self {
            stride_x: stride.0,
            stride_y: stride.1,
            pad_left: pad.0,
            pad_right: pad.1,
            pad_top: pad.2,
            pad_bottom: pad.3,
            activation: None,
        }
    }
}

impl Default for ConvInfo {
    fn default() -> Self {
        Self::new((1, 1), (0, 0, 0, 0))
    }
}

/// Begin/end/shrink masks of a strided slice; bit `i` refers to axis `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StridedSliceInfo {
    pub begin_mask: u32,
    pub end_mask: u32,
    pub shrink_axis_mask: u32,
}

impl StridedSliceInfo {
    pub fn begin_masked(&self, axis: usize) -> bool {
        axis < 32 && self.begin_mask & (1 << axis) != 0
    }

    pub fn end_masked(&self, axis: usize) -> bool {
        axis < 32 && self.end_mask & (1 << axis) != 0
    }

    pub fn shrinks(&self, axis: usize) -> bool {
        axis < 32 && self.shrink_axis_mask & (1 << axis) != 0
    }
}

/// One axis of a resolved strided slice: visit `extent` indices from `start` by `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceAxis {
    pub start: i64,
    pub stride: i64,
    pub extent: usize,
}

impl SliceAxis {
    /// Input index visited by output index `i`.
    pub fn source_index(&self, i: usize) -> usize {
        (self.start + i as i64 * self.stride) as usize
    }
}

/// Operation executed by a configured function, with everything resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Dense copy between equally sized tensors (flatten, reshape).
    Copy,
    StridedSlice { axes: Vec<SliceAxis> },
    Concatenate { axis: usize },
    Activation(ActivationFunction),
    Elementwise {
        op: ElementwiseOp,
        activation: Option<ActivationFunction>,
    },
    MatMul {
        activation: Option<ActivationFunction>,
    },
    Convolution(ConvInfo),
    Reverse { axes: Vec<usize> },
    Dequantize,
}

/// Tag identifying an [`Operation`] without its parameters; the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Copy,
    StridedSlice,
    Concatenate,
    Activation,
    Elementwise,
    MatMul,
    Convolution,
    Reverse,
    Dequantize,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Copy => OpKind::Copy,
            Operation::StridedSlice { .. } => OpKind::StridedSlice,
            Operation::Concatenate { .. } => OpKind::Concatenate,
            Operation::Activation(_) => OpKind::Activation,
            Operation::Elementwise { .. } => OpKind::Elementwise,
            Operation::MatMul { .. } => OpKind::MatMul,
            Operation::Convolution(_) => OpKind::Convolution,
            Operation::Reverse { .. } => OpKind::Reverse,
            Operation::Dequantize => OpKind::Dequantize,
        }
    }
}
