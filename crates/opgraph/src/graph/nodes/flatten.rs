use crate::error::{GraphError, Result};
use crate::tensor::{DataLayout, Shape, TensorDescriptor};

/// `[N, d1, .., dk] -> [N, d1 * .. * dk]`; a rank-1 `[d]` becomes `[1, d]`.
pub fn compute_output_descriptor(input: &TensorDescriptor) -> Result<TensorDescriptor> {
    let dims = input.shape.dims();
    let shape = match dims {
        [] => {
            return Err(GraphError::shape_mismatch(
                "flatten",
                "cannot flatten a rank-0 tensor",
            ))
        }
        [d] => Shape::from([1, *d]),
        [batch, rest @ ..] => Shape::from([*batch, rest.iter().product()]),
    };
    Ok(input
        .clone()
        .with_shape(shape)
        .with_layout(DataLayout::Unknown))
}
