//! Activation, elementwise and matrix-multiply descriptor rules.

use crate::error::{GraphError, Result};
use crate::ops::ElementwiseOp;
use crate::tensor::{Shape, TensorDescriptor};

pub fn activation_output(input: &TensorDescriptor) -> Result<TensorDescriptor> {
    if !input.data_type.is_float() {
        return Err(GraphError::shape_mismatch(
            "activation",
            format!("activations take float tensors, got {input}"),
        ));
    }
    Ok(input.clone())
}

pub fn elementwise_output(
    op: ElementwiseOp,
    lhs: &TensorDescriptor,
    rhs: &TensorDescriptor,
) -> Result<TensorDescriptor> {
    if lhs.shape != rhs.shape || lhs.data_type != rhs.data_type || lhs.layout != rhs.layout {
        return Err(GraphError::shape_mismatch(
            "elementwise",
            format!("operands {lhs} and {rhs} differ"),
        ));
    }
    if lhs.data_type.is_quantized() {
        return Err(GraphError::shape_mismatch(
            "elementwise",
            format!("quantized operands are not supported, got {lhs}"),
        ));
    }
    if op == ElementwiseOp::BitwiseXor && !lhs.data_type.is_integer() {
        return Err(GraphError::shape_mismatch(
            "elementwise",
            format!("bitwise xor needs integer operands, got {lhs}"),
        ));
    }
    Ok(lhs.clone())
}

/// `[M, K] x [K, N] -> [M, N]`.
pub fn matmul_output(lhs: &TensorDescriptor, rhs: &TensorDescriptor) -> Result<TensorDescriptor> {
    let (&[m, k], &[k2, n]) = (lhs.shape.dims(), rhs.shape.dims()) else {
        return Err(GraphError::shape_mismatch(
            "matmul",
            format!("matmul takes rank-2 operands, got {lhs} and {rhs}"),
        ));
    };
    if k != k2 {
        return Err(GraphError::shape_mismatch(
            "matmul",
            format!("inner extents differ: {} x {}", lhs.shape, rhs.shape),
        ));
    }
    if lhs.data_type != rhs.data_type || !lhs.data_type.is_float() {
        return Err(GraphError::shape_mismatch(
            "matmul",
            format!("operands must share a float type, got {lhs} and {rhs}"),
        ));
    }
    Ok(lhs.clone().with_shape(Shape::from([m, n])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    #[test]
    fn matmul_contracts_inner_axis() {
        let a = TensorDescriptor::new([2, 3], DataType::F32);
        let b = TensorDescriptor::new([3, 5], DataType::F32);
        assert_eq!(matmul_output(&a, &b).unwrap().shape.dims(), &[2, 5]);
        assert!(matmul_output(&b, &b).is_err());
    }

    #[test]
    fn xor_requires_integers() {
        let f = TensorDescriptor::new([4], DataType::F32);
        let i = TensorDescriptor::new([4], DataType::S32);
        assert!(elementwise_output(ElementwiseOp::BitwiseXor, &f, &f).is_err());
        assert!(elementwise_output(ElementwiseOp::BitwiseXor, &i, &i).is_ok());
        assert!(elementwise_output(ElementwiseOp::Add, &f, &i).is_err());
    }

    #[test]
    fn activation_rejects_integers() {
        assert!(activation_output(&TensorDescriptor::new([2], DataType::U8)).is_err());
    }
}
