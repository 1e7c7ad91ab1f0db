use half::f16;
use opgraph::error::{GraphError, Result};
use opgraph::kernels::{
    Kernel, KernelConfig, KernelContext, KernelRegistry, KernelVariant, TensorPack, TensorRole,
    VariantRequirements,
};
use opgraph::ops::{OpKind, Operation};
use opgraph::tensor::shape::contiguous_strides;
use opgraph::tensor::{DataType, Element, QuantizationInfo, StorageKind};

use super::{coordinate, wrong_operation};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry.register(KernelVariant::new(
        "dequantize",
        OpKind::Dequantize,
        VariantRequirements::new().data_types([
            DataType::QAsymm8,
            DataType::QAsymm8Signed,
            DataType::QSymm8,
            DataType::QSymm8PerChannel,
            DataType::QSymm16,
        ]),
        DequantizeKernel::build,
    ));
}

/// `(q - offset) * scale`, per channel when the input carries per-channel
/// parameters.
struct DequantizeKernel {
    quant: QuantizationInfo,
    output: StorageKind,
    dims: Vec<usize>,
    /// Axis that selects the per-channel parameters.
    channel_axis: Option<usize>,
    chunk: usize,
}

impl DequantizeKernel {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        if !matches!(config.operation, Operation::Dequantize) {
            return Err(wrong_operation(OpKind::Dequantize, config));
        }
        let input = &config.inputs[0];
        let channel_axis = match input.quant {
            QuantizationInfo::PerChannel { .. } => Some(input.depth_axis().ok_or_else(|| {
                GraphError::unsupported(
                    OpKind::Dequantize,
                    format!("{input} has per-channel parameters but no channel axis"),
                )
            })?),
            _ => None,
        };
        Ok(Box::new(DequantizeKernel {
            quant: input.quant.clone(),
            output: config.output.data_type.storage_kind(),
            dims: input.shape.dims().to_vec(),
            channel_axis,
            chunk: config.tiling.chunk,
        }))
    }

    fn run_typed<T: Element>(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let raw = cx
            .arena
            .gather_data(pack.require(TensorRole::Src(0))?)?
            .to_f32_vec();
        let strides = contiguous_strides(&self.dims);
        let mut out = vec![T::default(); raw.len()];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                let index = offset + i;
                let channel = self
                    .channel_axis
                    .map_or(0, |axis| coordinate(index, &strides, &self.dims, axis));
                let (scale, zero) = self.quant.params_for_channel(channel);
                *value = T::from_f32((raw[index] - zero as f32) * scale);
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

impl Kernel for DequantizeKernel {
    fn name(&self) -> &str {
        "dequantize"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        match self.output {
            StorageKind::F32 => self.run_typed::<f32>(pack, cx),
            StorageKind::F16 => self.run_typed::<f16>(pack, cx),
            other => Err(GraphError::execution(format!(
                "dequantize cannot write {other:?} storage"
            ))),
        }
    }
}
