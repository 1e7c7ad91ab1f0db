use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Enumerates element types understood by descriptors and kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F16,
    F32,
    /// Asymmetric 8-bit unsigned quantized values (scale + zero point).
    QAsymm8,
    /// Asymmetric 8-bit signed quantized values (scale + zero point).
    QAsymm8Signed,
    /// Symmetric 8-bit signed quantized values (scale only).
    QSymm8,
    /// Symmetric 8-bit signed quantized values with one scale per channel.
    QSymm8PerChannel,
    /// Symmetric 16-bit signed quantized values.
    QSymm16,
}

/// Physical element representation backing a [`DataType`] in host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F16,
    F32,
}

impl DataType {
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::F32)
    }

    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            DataType::QAsymm8
                | DataType::QAsymm8Signed
                | DataType::QSymm8
                | DataType::QSymm8PerChannel
                | DataType::QSymm16
        )
    }

    /// Returns `true` for plain (non-quantized) integer types.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::U8
                | DataType::S8
                | DataType::U16
                | DataType::S16
                | DataType::U32
                | DataType::S32
        )
    }

    pub fn storage_kind(self) -> StorageKind {
        match self {
            DataType::U8 | DataType::QAsymm8 => StorageKind::U8,
            DataType::S8 | DataType::QAsymm8Signed | DataType::QSymm8 | DataType::QSymm8PerChannel => {
                StorageKind::I8
            }
            DataType::U16 => StorageKind::U16,
            DataType::S16 | DataType::QSymm16 => StorageKind::I16,
            DataType::U32 => StorageKind::U32,
            DataType::S32 => StorageKind::I32,
            DataType::F16 => StorageKind::F16,
            DataType::F32 => StorageKind::F32,
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self.storage_kind() {
            StorageKind::U8 | StorageKind::I8 => 1,
            StorageKind::U16 | StorageKind::I16 | StorageKind::F16 => 2,
            StorageKind::U32 | StorageKind::I32 | StorageKind::F32 => 4,
        }
    }
}

/// Memory layout of a rank-4 activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLayout {
    /// Batch, channel, height, width (channel-first).
    Nchw,
    /// Batch, height, width, channel (channel-last).
    Nhwc,
    /// No layout semantics attached (matrices, vectors, flattened data).
    Unknown,
}

/// Logical dimensions addressed by layout-aware operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutDimension {
    Batch,
    Channel,
    Height,
    Width,
}

impl DataLayout {
    /// Index of `dim` in an outermost-first shape of the given rank.
    ///
    /// For `Unknown` layouts the channel axis falls back to `rank - 3` so that
    /// `[C, H, W]` volumes concatenate along depth; lower ranks use the last axis.
    pub fn dimension_index(self, dim: LayoutDimension, rank: usize) -> Option<usize> {
        match (self, dim) {
            (DataLayout::Nchw, LayoutDimension::Batch) | (DataLayout::Nhwc, LayoutDimension::Batch) => {
                (rank == 4).then_some(0)
            }
            (DataLayout::Nchw, LayoutDimension::Channel) => (rank == 4).then_some(1),
            (DataLayout::Nchw, LayoutDimension::Height) => (rank == 4).then_some(2),
            (DataLayout::Nchw, LayoutDimension::Width) => (rank == 4).then_some(3),
            (DataLayout::Nhwc, LayoutDimension::Height) => (rank == 4).then_some(1),
            (DataLayout::Nhwc, LayoutDimension::Width) => (rank == 4).then_some(2),
            (DataLayout::Nhwc, LayoutDimension::Channel) => (rank == 4).then_some(3),
            (DataLayout::Unknown, LayoutDimension::Channel) => match rank {
                0 => None,
                1 | 2 => Some(rank - 1),
                _ => Some(rank - 3),
            },
            (DataLayout::Unknown, _) => None,
        }
    }

    /// Axis along which depth concatenation operates.
    pub fn depth_axis(self, rank: usize) -> Option<usize> {
        self.dimension_index(LayoutDimension::Channel, rank)
    }
}

/// Quantization parameters attached to a descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum QuantizationInfo {
    #[default]
    None,
    Uniform {
        scale: f32,
        offset: i32,
    },
    PerChannel {
        scales: Vec<f32>,
        offsets: Vec<i32>,
    },
}

impl QuantizationInfo {
    pub fn uniform(scale: f32, offset: i32) -> Self {
        QuantizationInfo::Uniform { scale, offset }
    }

    /// Per-channel parameters; `offsets` may be empty for symmetric schemes.
    pub fn per_channel(scales: Vec<f32>, offsets: Vec<i32>) -> Result<Self> {
        if scales.is_empty() {
            return Err(GraphError::invalid_argument(
                "per-channel quantization requires at least one scale",
            ));
        }
        if !offsets.is_empty() && offsets.len() != scales.len() {
            return Err(GraphError::invalid_argument(format!(
                "per-channel quantization has {} scales but {} offsets",
                scales.len(),
                offsets.len()
            )));
        }
        Ok(QuantizationInfo::PerChannel { scales, offsets })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, QuantizationInfo::None)
    }

    /// Scale and zero point applied to elements of channel `channel`.
    pub fn params_for_channel(&self, channel: usize) -> (f32, i32) {
        match self {
            QuantizationInfo::None => (1.0, 0),
            QuantizationInfo::Uniform { scale, offset } => (*scale, *offset),
            QuantizationInfo::PerChannel { scales, offsets } => {
                let idx = channel.min(scales.len().saturating_sub(1));
                (
                    scales.get(idx).copied().unwrap_or(1.0),
                    offsets.get(idx).copied().unwrap_or(0),
                )
            }
        }
    }
}
