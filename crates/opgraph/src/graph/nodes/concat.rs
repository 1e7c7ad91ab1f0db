//! Concatenation descriptor rules.

use crate::error::{GraphError, Result};
use crate::tensor::TensorDescriptor;

/// Concatenates `inputs` along `axis`.
///
/// Every input must share rank, data type, layout and quantization, and agree
/// on every other axis.
pub fn compute_concat_descriptor(
    inputs: &[&TensorDescriptor],
    axis: usize,
) -> Result<TensorDescriptor> {
    let first = inputs.first().ok_or_else(|| {
        GraphError::shape_mismatch("concatenate", "concatenation needs at least one input")
    })?;
    if axis >= first.rank() {
        return Err(GraphError::shape_mismatch(
            "concatenate",
            format!("axis {axis} out of range for rank {}", first.rank()),
        ));
    }
    let mut extent = 0usize;
    for (i, desc) in inputs.iter().enumerate() {
        if !desc.same_element_format(first) {
            return Err(GraphError::shape_mismatch(
                "concatenate",
                format!("input {i} is {desc}, expected the format of {first}"),
            ));
        }
        if !desc.shape.matches_except(&first.shape, axis) {
            return Err(GraphError::shape_mismatch(
                "concatenate",
                format!(
                    "input {i} shape {} differs from {} outside axis {axis}",
                    desc.shape, first.shape
                ),
            ));
        }
        extent += desc.shape.dims()[axis];
    }
    let shape = first.shape.with_dim(axis, extent);
    Ok((*first).clone().with_shape(shape))
}

/// Depth axis shared by every input of a depth concatenation.
pub fn depth_axis(inputs: &[&TensorDescriptor]) -> Result<usize> {
    let first = inputs.first().ok_or_else(|| {
        GraphError::shape_mismatch("depth_concatenate", "concatenation needs at least one input")
    })?;
    first.depth_axis().ok_or_else(|| {
        GraphError::shape_mismatch(
            "depth_concatenate",
            format!("{first} has no depth axis"),
        )
    })
}

pub fn compute_output_descriptor(inputs: &[&TensorDescriptor]) -> Result<TensorDescriptor> {
    let axis = depth_axis(inputs)?;
    compute_concat_descriptor(inputs, axis)
}

/// Offset of each input along `axis` inside the concatenated output.
pub fn axis_offsets(inputs: &[&TensorDescriptor], axis: usize) -> Vec<usize> {
    inputs
        .iter()
        .scan(0usize, |offset, desc| {
            let start = *offset;
            *offset += desc.shape.dim(axis).unwrap_or(0);
            Some(start)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataLayout, DataType, QuantizationInfo};

    fn nchw(c: usize) -> TensorDescriptor {
        TensorDescriptor::new([1, c, 4, 4], DataType::F32).with_layout(DataLayout::Nchw)
    }

    #[test]
    fn sums_channel_extent() {
        let a = nchw(3);
        let b = nchw(5);
        let out = compute_output_descriptor(&[&a, &b]).unwrap();
        assert_eq!(out.shape.dims(), &[1, 8, 4, 4]);
        assert_eq!(axis_offsets(&[&a, &b], 1), vec![0, 3]);
    }

    #[test]
    fn nhwc_concatenates_last_axis() {
        let a = TensorDescriptor::new([1, 2, 2, 3], DataType::F16).with_layout(DataLayout::Nhwc);
        let b = TensorDescriptor::new([1, 2, 2, 1], DataType::F16).with_layout(DataLayout::Nhwc);
        let out = compute_output_descriptor(&[&a, &b]).unwrap();
        assert_eq!(out.shape.dims(), &[1, 2, 2, 4]);
    }

    #[test]
    fn mismatched_spatial_extent_is_rejected() {
        let a = nchw(3);
        let b = TensorDescriptor::new([1, 2, 4, 5], DataType::F32).with_layout(DataLayout::Nchw);
        let err = compute_output_descriptor(&[&a, &b]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn mismatched_quantization_is_rejected() {
        let a = nchw(2).with_data_type(DataType::QAsymm8);
        let b = a.clone().with_quant(QuantizationInfo::uniform(0.1, 4));
        assert!(compute_output_descriptor(&[&a, &b]).is_err());
    }

    #[test]
    fn empty_input_list_is_rejected() {
        assert!(compute_output_descriptor(&[]).is_err());
    }
}
