use crate::error::{GraphError, Result};
use crate::tensor::TensorDescriptor;

/// Normalizes reverse axes against `rank`.
///
/// With `use_inverted_axis` axis `a` counts from the innermost dimension and
/// maps to `rank - 1 - a`. The result is sorted and duplicate free.
pub fn resolve_axes(rank: usize, axes: &[usize], use_inverted_axis: bool) -> Result<Vec<usize>> {
    let mut resolved = Vec::with_capacity(axes.len());
    for &axis in axes {
        if axis >= rank {
            return Err(GraphError::invalid_argument(format!(
                "reverse axis {axis} out of range for rank {rank}"
            )));
        }
        let axis = if use_inverted_axis { rank - 1 - axis } else { axis };
        if resolved.contains(&axis) {
            return Err(GraphError::invalid_argument(format!(
                "reverse axis {axis} listed twice"
            )));
        }
        resolved.push(axis);
    }
    resolved.sort_unstable();
    Ok(resolved)
}

pub fn compute_output_descriptor(
    input: &TensorDescriptor,
    axes: &[usize],
    use_inverted_axis: bool,
) -> Result<TensorDescriptor> {
    resolve_axes(input.rank(), axes, use_inverted_axis)?;
    Ok(input.clone())
}
