//! Semantic validation of an operation against its bound descriptors.

use crate::error::{GraphError, Result};
use crate::graph::nodes::{arithmetic, concat, convolution, dequantize};
use crate::ops::Operation;
use crate::tensor::TensorDescriptor;

const WHERE: &str = "function";

pub(crate) fn check_operation(
    op: &Operation,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
) -> Result<()> {
    match op {
        Operation::Copy => {
            let input = single(op, inputs)?;
            if input.num_elements() != output.num_elements()
                || input.data_type.storage_kind() != output.data_type.storage_kind()
            {
                return Err(GraphError::shape_mismatch(
                    WHERE,
                    format!("cannot copy {input} into {output}"),
                ));
            }
            Ok(())
        }
        Operation::StridedSlice { axes } => {
            let input = single(op, inputs)?;
            if axes.len() != input.rank() {
                return Err(GraphError::invalid_argument(format!(
                    "{} slice axes for rank-{} input",
                    axes.len(),
                    input.rank()
                )));
            }
            for (axis, slice) in axes.iter().enumerate() {
                if slice.extent == 0 {
                    continue;
                }
                let extent = input.shape.dims()[axis] as i64;
                let first = slice.start;
                let last = slice.start + (slice.extent as i64 - 1) * slice.stride;
                if !(0..extent).contains(&first) || !(0..extent).contains(&last) {
                    return Err(GraphError::invalid_argument(format!(
                        "slice on axis {axis} reads outside 0..{extent}"
                    )));
                }
            }
            let count: usize = axes.iter().map(|slice| slice.extent).product();
            if count != output.num_elements() || input.data_type != output.data_type {
                return Err(GraphError::shape_mismatch(
                    WHERE,
                    format!("slice of {input} yields {count} elements, output is {output}"),
                ));
            }
            Ok(())
        }
        Operation::Concatenate { axis } => {
            let refs: Vec<&TensorDescriptor> = inputs.iter().collect();
            expect_output(&concat::compute_concat_descriptor(&refs, *axis)?, output)
        }
        Operation::Activation(_) => {
            expect_output(&arithmetic::activation_output(single(op, inputs)?)?, output)
        }
        Operation::Elementwise { op: kind, .. } => {
            let [lhs, rhs] = pair(op, inputs)?;
            expect_output(&arithmetic::elementwise_output(*kind, lhs, rhs)?, output)
        }
        Operation::MatMul { .. } => {
            let [lhs, rhs] = pair(op, inputs)?;
            expect_output(&arithmetic::matmul_output(lhs, rhs)?, output)
        }
        Operation::Convolution(info) => {
            if !(2..=3).contains(&inputs.len()) {
                return Err(arity(op, inputs.len()));
            }
            let expected =
                convolution::compute_output_descriptor(&inputs[0], &inputs[1], inputs.get(2), info)?;
            expect_output(&expected, output)
        }
        Operation::Reverse { axes } => {
            let input = single(op, inputs)?;
            if axes.iter().any(|axis| *axis >= input.rank())
                || axes.windows(2).any(|pair| pair[0] >= pair[1])
            {
                return Err(GraphError::invalid_argument(format!(
                    "reverse axes {axes:?} must be sorted, unique and below rank {}",
                    input.rank()
                )));
            }
            expect_output(input, output)
        }
        Operation::Dequantize => {
            let input = single(op, inputs)?;
            expect_output(
                &dequantize::compute_output_descriptor(input, output.data_type)?,
                output,
            )
        }
    }
}

fn single<'a>(op: &Operation, inputs: &'a [TensorDescriptor]) -> Result<&'a TensorDescriptor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(arity(op, inputs.len())),
    }
}

fn pair<'a>(op: &Operation, inputs: &'a [TensorDescriptor]) -> Result<[&'a TensorDescriptor; 2]> {
    match inputs {
        [lhs, rhs] => Ok([lhs, rhs]),
        _ => Err(arity(op, inputs.len())),
    }
}

fn arity(op: &Operation, count: usize) -> GraphError {
    GraphError::shape_mismatch(WHERE, format!("{:?} cannot take {count} inputs", op.kind()))
}

fn expect_output(expected: &TensorDescriptor, output: &TensorDescriptor) -> Result<()> {
    if expected.shape != output.shape || expected.data_type != output.data_type {
        return Err(GraphError::shape_mismatch(
            WHERE,
            format!("expected output {expected}, got {output}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::SliceAxis;
    use crate::tensor::DataType;

    #[test]
    fn slice_reading_past_the_end_is_rejected() {
        let input = TensorDescriptor::new([4], DataType::F32);
        let output = TensorDescriptor::new([3], DataType::F32);
        let op = Operation::StridedSlice {
            axes: vec![SliceAxis {
                start: 2,
                stride: 1,
                extent: 3,
            }],
        };
        assert!(check_operation(&op, &[input], &output).is_err());
    }

    #[test]
    fn copy_requires_equal_sizes() {
        let input = TensorDescriptor::new([2, 3], DataType::F32);
        assert!(check_operation(&Operation::Copy, &[input.clone()], &input.clone().with_shape([6])).is_ok());
        assert!(check_operation(&Operation::Copy, &[input.clone()], &input.with_shape([5])).is_err());
    }
}
