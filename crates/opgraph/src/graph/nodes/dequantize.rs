use crate::error::{GraphError, Result};
use crate::tensor::{DataType, QuantizationInfo, TensorDescriptor};

pub fn compute_output_descriptor(
    input: &TensorDescriptor,
    output_type: DataType,
) -> Result<TensorDescriptor> {
    if !input.data_type.is_quantized() {
        return Err(GraphError::shape_mismatch(
            "dequantize",
            format!("input {input} is not quantized"),
        ));
    }
    if !output_type.is_float() {
        return Err(GraphError::invalid_argument(format!(
            "dequantize produces F16 or F32, not {output_type:?}"
        )));
    }
    Ok(input
        .clone()
        .with_data_type(output_type)
        .with_quant(QuantizationInfo::None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_quantization() {
        let input = TensorDescriptor::new([2, 2], DataType::QAsymm8)
            .with_quant(QuantizationInfo::uniform(0.25, 10));
        let out = compute_output_descriptor(&input, DataType::F32).unwrap();
        assert_eq!(out.data_type, DataType::F32);
        assert!(out.quant.is_none());
        assert!(compute_output_descriptor(&out, DataType::F32).is_err());
    }
}
