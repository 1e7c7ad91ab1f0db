//! Direct 2-D convolution geometry.

use crate::error::{GraphError, Result};
use crate::ops::ConvInfo;
use crate::tensor::{DataLayout, Shape, TensorDescriptor};

/// Resolved extents of one convolution, independent of layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub layout: DataLayout,
    pub batch: usize,
    pub in_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_channels: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub out_height: usize,
    pub out_width: usize,
}

impl ConvGeometry {
    pub fn new(
        input: &TensorDescriptor,
        weights: &TensorDescriptor,
        info: &ConvInfo,
    ) -> Result<ConvGeometry> {
        if info.stride_x == 0 || info.stride_y == 0 {
            return Err(GraphError::invalid_argument(format!(
                "convolution stride ({}, {}) must be positive",
                info.stride_x, info.stride_y
            )));
        }
        let (&[i0, i1, i2, i3], &[w0, w1, w2, w3]) = (input.shape.dims(), weights.shape.dims()) else {
            return Err(GraphError::shape_mismatch(
                "convolution",
                format!("expected rank-4 input and weights, got {input} and {weights}"),
            ));
        };
        let (batch, in_channels, in_height, in_width, weight_channels, kernel_height, kernel_width) =
            match input.layout {
                DataLayout::Nchw => (i0, i1, i2, i3, w1, w2, w3),
                DataLayout::Nhwc => (i0, i3, i1, i2, w3, w1, w2),
                DataLayout::Unknown => {
                    return Err(GraphError::shape_mismatch(
                        "convolution",
                        format!("input {input} must be Nchw or Nhwc"),
                    ))
                }
            };
        let out_channels = w0;
        if weight_channels != in_channels {
            return Err(GraphError::shape_mismatch(
                "convolution",
                format!("weights expect {weight_channels} input channels, input has {in_channels}"),
            ));
        }
        let padded_h = in_height + info.pad_top + info.pad_bottom;
        let padded_w = in_width + info.pad_left + info.pad_right;
        if kernel_height == 0 || kernel_width == 0 || kernel_height > padded_h || kernel_width > padded_w {
            return Err(GraphError::shape_mismatch(
                "convolution",
                format!(
                    "kernel {kernel_height}x{kernel_width} does not fit padded input {padded_h}x{padded_w}"
                ),
            ));
        }
        Ok(ConvGeometry {
            layout: input.layout,
            batch,
            in_channels,
            in_height,
            in_width,
            out_channels,
            kernel_height,
            kernel_width,
            out_height: (padded_h - kernel_height) / info.stride_y + 1,
            out_width: (padded_w - kernel_width) / info.stride_x + 1,
        })
    }

    pub fn output_shape(&self) -> Shape {
        match self.layout {
            DataLayout::Nhwc => Shape::from([self.batch, self.out_height, self.out_width, self.out_channels]),
            _ => Shape::from([self.batch, self.out_channels, self.out_height, self.out_width]),
        }
    }
}

pub fn compute_output_descriptor(
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
    info: &ConvInfo,
) -> Result<TensorDescriptor> {
    let geometry = ConvGeometry::new(input, weights, info)?;
    if weights.data_type != input.data_type {
        return Err(GraphError::shape_mismatch(
            "convolution",
            format!("weights {weights} do not match input {input}"),
        ));
    }
    if let Some(bias) = bias {
        if bias.shape.dims() != [geometry.out_channels] {
            return Err(GraphError::shape_mismatch(
                "convolution",
                format!("bias {bias} must be [{}]", geometry.out_channels),
            ));
        }
    }
    Ok(input.clone().with_shape(geometry.output_shape()))
}
