//! Strided slice descriptor propagation.
//!
//! Resolution follows the usual strided-slice conventions:
//! - negative starts/ends count from the end of the axis;
//! - positive strides clamp start/end into `[0, extent]`, negative strides
//!   into `[-1, extent - 1]` (`-1` meaning "before the first element");
//! - a begin mask bit replaces the start with the first index visited in
//!   stride direction, an end mask bit replaces the end with the axis bound;
//! - a shrink bit keeps only `start` and drops the axis from the output.

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::ops::{SliceAxis, StridedSliceInfo};
use crate::tensor::{Coordinates, DataLayout, Shape, TensorDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StridedSliceParams {
    pub starts: Coordinates,
    pub ends: Coordinates,
    pub strides: Coordinates,
    pub info: StridedSliceInfo,
}

impl StridedSliceParams {
    pub fn new(
        starts: impl IntoIterator<Item = i64>,
        ends: impl IntoIterator<Item = i64>,
        strides: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            starts: starts.into_iter().collect(),
            ends: ends.into_iter().collect(),
            strides: strides.into_iter().collect(),
            info: StridedSliceInfo::default(),
        }
    }

    pub fn with_info(mut self, info: StridedSliceInfo) -> Self {
        self.info = info;
        self
    }
}

/// Resolves every axis of the slice against `shape`.
///
/// The returned axes include shrunk axes (with extent 1); use
/// [`output_shape`] to drop them.
pub fn resolve_strided_slice(shape: &Shape, params: &StridedSliceParams) -> Result<Vec<SliceAxis>> {
    let rank = shape.rank();
    for (what, len) in [
        ("starts", params.starts.len()),
        ("ends", params.ends.len()),
        ("strides", params.strides.len()),
    ] {
        if len != rank {
            return Err(GraphError::invalid_argument(format!(
                "strided slice {what} has {len} coordinates for a rank-{rank} input"
            )));
        }
    }

    let mut axes = Vec::with_capacity(rank);
    for axis in 0..rank {
        let extent = shape.dims()[axis] as i64;
        let stride = params.strides[axis];
        if stride == 0 {
            return Err(GraphError::invalid_argument(format!(
                "strided slice stride on axis {axis} is zero"
            )));
        }
        let normalize = |x: i64| if x < 0 { x + extent } else { x };

        if params.info.shrinks(axis) {
            let start = if params.info.begin_masked(axis) {
                if stride > 0 {
                    0
                } else {
                    extent - 1
                }
            } else {
                normalize(params.starts[axis])
            };
            if start < 0 || start >= extent {
                return Err(GraphError::invalid_argument(format!(
                    "shrunk axis {axis} selects index {} outside extent {extent}",
                    params.starts[axis]
                )));
            }
            axes.push(SliceAxis {
                start,
                stride: 1,
                extent: 1,
            });
            continue;
        }

        let (start, extent_out) = if stride > 0 {
            let start = if params.info.begin_masked(axis) {
                0
            } else {
                normalize(params.starts[axis]).clamp(0, extent)
            };
            let end = if params.info.end_masked(axis) {
                extent
            } else {
                normalize(params.ends[axis]).clamp(0, extent)
            };
            let count = if end > start {
                (end - start - 1) / stride + 1
            } else {
                0
            };
            (start, count)
        } else {
            let start = if params.info.begin_masked(axis) {
                extent - 1
            } else {
                normalize(params.starts[axis]).clamp(-1, extent - 1)
            };
            let end = if params.info.end_masked(axis) {
                -1
            } else {
                normalize(params.ends[axis]).clamp(-1, extent - 1)
            };
            // `start - end` is at most `extent`, so only the stride can be huge.
            let count = if start > end {
                ((start - end - 1) as u64 / stride.unsigned_abs() + 1) as i64
            } else {
                0
            };
            (start, count)
        };

        axes.push(SliceAxis {
            start,
            stride,
            extent: extent_out as usize,
        });
    }
    Ok(axes)
}

/// Output shape of a resolved slice, with shrunk axes removed.
pub fn output_shape(axes: &[SliceAxis], info: &StridedSliceInfo) -> Shape {
    let dims: Vec<usize> = axes
        .iter()
        .enumerate()
        .filter(|(axis, _)| !info.shrinks(*axis))
        .map(|(_, a)| a.extent)
        .collect();
    if dims.is_empty() {
        Shape::from([1])
    } else {
        Shape::from(dims)
    }
}

/// Computes the output descriptor of a strided slice over `input`.
pub fn compute_output_descriptor(
    input: &TensorDescriptor,
    params: &StridedSliceParams,
) -> Result<TensorDescriptor> {
    let axes = resolve_strided_slice(&input.shape, params)?;
    let shape = output_shape(&axes, &params.info);
    let layout = if shape.rank() == input.rank() {
        input.layout
    } else {
        DataLayout::Unknown
    };
    Ok(input.clone().with_shape(shape).with_layout(layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    fn desc(dims: &[usize]) -> TensorDescriptor {
        TensorDescriptor::new(Shape::from(dims), DataType::F32)
    }

    #[test]
    fn identity_slice_keeps_shape() {
        let params = StridedSliceParams::new([0, 0], [4, 4], [1, 1]);
        let out = compute_output_descriptor(&desc(&[4, 4]), &params).unwrap();
        assert_eq!(out.shape.dims(), &[4, 4]);
    }

    #[test]
    fn stride_two_halves_each_axis() {
        let params = StridedSliceParams::new([0, 0], [4, 4], [2, 2]);
        let axes = resolve_strided_slice(&Shape::from([4, 4]), &params).unwrap();
        assert_eq!(axes[0].extent, 2);
        assert_eq!(axes[1].source_index(1), 2);
    }

    #[test]
    fn negative_indices_count_from_end() {
        let params = StridedSliceParams::new([-3], [-1], [1]);
        let axes = resolve_strided_slice(&Shape::from([5]), &params).unwrap();
        assert_eq!(axes[0].start, 2);
        assert_eq!(axes[0].extent, 2);
    }

    #[test]
    fn negative_stride_walks_backwards() {
        let params = StridedSliceParams::new([4], [0], [-2]);
        let axes = resolve_strided_slice(&Shape::from([5]), &params).unwrap();
        assert_eq!(axes[0].extent, 2);
        assert_eq!(axes[0].source_index(0), 4);
        assert_eq!(axes[0].source_index(1), 2);
    }

    #[test]
    fn end_mask_with_negative_stride_reaches_first_element() {
        let params = StridedSliceParams::new([0], [0], [-1]).with_info(StridedSliceInfo {
            begin_mask: 1,
            end_mask: 1,
            shrink_axis_mask: 0,
        });
        let axes = resolve_strided_slice(&Shape::from([3]), &params).unwrap();
        assert_eq!(axes[0].extent, 3);
        assert_eq!(axes[0].source_index(2), 0);
    }

    #[test]
    fn out_of_range_bounds_are_clamped() {
        let params = StridedSliceParams::new([-10, 2], [10, 100], [1, 3]);
        let out = compute_output_descriptor(&desc(&[3, 8]), &params).unwrap();
        assert_eq!(out.shape.dims(), &[3, 2]);
    }

    #[test]
    fn shrink_drops_axis() {
        let params = StridedSliceParams::new([1, 0], [2, 4], [1, 1]).with_info(StridedSliceInfo {
            shrink_axis_mask: 1,
            ..Default::default()
        });
        let out = compute_output_descriptor(&desc(&[3, 4]), &params).unwrap();
        assert_eq!(out.shape.dims(), &[4]);
    }

    #[test]
    fn zero_stride_is_invalid() {
        let params = StridedSliceParams::new([0], [2], [0]);
        let err = compute_output_descriptor(&desc(&[4]), &params).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn coordinate_rank_must_match_input() {
        let params = StridedSliceParams::new([0], [2], [1]);
        let err = compute_output_descriptor(&desc(&[4, 4]), &params).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn extreme_strides_take_a_single_element() {
        let params = StridedSliceParams::new([0], [4], [i64::MAX]);
        let axes = resolve_strided_slice(&Shape::from([4]), &params).unwrap();
        assert_eq!((axes[0].start, axes[0].extent), (0, 1));
        assert_eq!(axes[0].source_index(0), 0);

        let params = StridedSliceParams::new([-1], [-5], [i64::MIN]);
        let axes = resolve_strided_slice(&Shape::from([4]), &params).unwrap();
        assert_eq!((axes[0].start, axes[0].extent), (3, 1));
        assert_eq!(axes[0].source_index(0), 3);

        let params = StridedSliceParams::new([i64::MIN], [i64::MAX], [i64::MIN + 1]);
        let out = compute_output_descriptor(&desc(&[4]), &params).unwrap();
        assert_eq!(out.shape.dims(), &[0]);
    }

    #[test]
    fn empty_range_yields_zero_extent() {
        let params = StridedSliceParams::new([3], [1], [1]);
        let out = compute_output_descriptor(&desc(&[4]), &params).unwrap();
        assert_eq!(out.shape.dims(), &[0]);
    }
}
