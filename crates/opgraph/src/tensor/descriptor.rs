use std::fmt;

use serde::{Deserialize, Serialize};

use super::dtype::{DataLayout, DataType, QuantizationInfo};
use super::shape::Shape;

/// Metadata describing a tensor without owning storage.
///
/// Descriptors are plain values: rank is fixed at construction and a
/// "changed" descriptor is always a new value replacing the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub shape: Shape,
    pub data_type: DataType,
    pub layout: DataLayout,
    pub quant: QuantizationInfo,
}

impl TensorDescriptor {
    pub fn new(shape: impl Into<Shape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            layout: DataLayout::Unknown,
            quant: QuantizationInfo::None,
        }
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_quant(mut self, quant: QuantizationInfo) -> Self {
        self.quant = quant;
        self
    }

    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.data_type.element_size()
    }

    /// Depth (channel) axis for this descriptor's layout and rank.
    pub fn depth_axis(&self) -> Option<usize> {
        self.layout.depth_axis(self.rank())
    }

    /// Returns `true` when data type, layout and quantization agree.
    pub fn same_element_format(&self, other: &TensorDescriptor) -> bool {
        self.data_type == other.data_type && self.layout == other.layout && self.quant == other.quant
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{:?}, {}", self.data_type, self.shape)?;
        if self.layout != DataLayout::Unknown {
            write!(f, ", {:?}", self.layout)?;
        }
        match &self.quant {
            QuantizationInfo::None => {}
            QuantizationInfo::Uniform { scale, offset } => write!(f, ", q({scale}, {offset})")?,
            QuantizationInfo::PerChannel { scales, .. } => write!(f, ", q[{}]", scales.len())?,
        }
        write!(f, ">")
    }
}
