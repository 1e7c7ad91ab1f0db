//! Direct 2-D convolution for `Nchw` and `Nhwc` tensors.

use std::marker::PhantomData;

use half::f16;
use opgraph::error::Result;
use opgraph::graph::nodes::ConvGeometry;
use opgraph::kernels::{
    CpuFeature, Kernel, KernelConfig, KernelContext, KernelRegistry, KernelVariant, TensorPack,
    TensorRole, VariantRequirements,
};
use opgraph::ops::{ConvInfo, OpKind, Operation};
use opgraph::tensor::{DataLayout, DataType, Element};

use super::wrong_operation;

pub(super) fn register(registry: &mut KernelRegistry) {
    registry
        .register(KernelVariant::new(
            "conv2d_direct",
            OpKind::Convolution,
            VariantRequirements::new()
                .data_types([DataType::F32, DataType::F16])
                .layouts([DataLayout::Nchw, DataLayout::Nhwc]),
            |config| match config.inputs[0].data_type {
                DataType::F16 => DirectConv::<f16>::build("conv2d_direct", config),
                _ => DirectConv::<f32>::build("conv2d_direct", config),
            },
        ))
        // Channel-last with enough channels keeps the reduction contiguous.
        .register(KernelVariant::new(
            "conv2d_direct_nhwc_avx2",
            OpKind::Convolution,
            VariantRequirements::new()
                .data_types([DataType::F32])
                .layouts([DataLayout::Nhwc])
                .feature(CpuFeature::Avx2)
                .min_channels(8),
            |config| DirectConv::<f32>::build("conv2d_direct_nhwc_avx2", config),
        ));
}

struct DirectConv<T> {
    name: &'static str,
    geometry: ConvGeometry,
    info: ConvInfo,
    chunk: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> DirectConv<T> {
    fn build(name: &'static str, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let Operation::Convolution(info) = config.operation else {
            return Err(wrong_operation(OpKind::Convolution, config));
        };
        let geometry = ConvGeometry::new(&config.inputs[0], &config.inputs[1], &info)?;
        Ok(Box::new(DirectConv::<T> {
            name,
            geometry,
            info,
            chunk: config.tiling.chunk,
            _element: PhantomData,
        }))
    }

    fn input_index(&self, batch: usize, channel: usize, y: usize, x: usize) -> usize {
        let g = &self.geometry;
        match g.layout {
            DataLayout::Nhwc => ((batch * g.in_height + y) * g.in_width + x) * g.in_channels + channel,
            _ => ((batch * g.in_channels + channel) * g.in_height + y) * g.in_width + x,
        }
    }

    fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        let g = &self.geometry;
        match g.layout {
            DataLayout::Nhwc => ((oc * g.kernel_height + ky) * g.kernel_width + kx) * g.in_channels + ic,
            _ => ((oc * g.in_channels + ic) * g.kernel_height + ky) * g.kernel_width + kx,
        }
    }

    /// `(batch, out channel, out y, out x)` of flat output `index`.
    fn output_coords(&self, index: usize) -> (usize, usize, usize, usize) {
        let g = &self.geometry;
        match g.layout {
            DataLayout::Nhwc => {
                let oc = index % g.out_channels;
                let ox = (index / g.out_channels) % g.out_width;
                let oy = (index / (g.out_channels * g.out_width)) % g.out_height;
                (index / (g.out_channels * g.out_width * g.out_height), oc, oy, ox)
            }
            _ => {
                let ox = index % g.out_width;
                let oy = (index / g.out_width) % g.out_height;
                let oc = (index / (g.out_width * g.out_height)) % g.out_channels;
                (index / (g.out_width * g.out_height * g.out_channels), oc, oy, ox)
            }
        }
    }
}

fn widen<T: Element>(values: Vec<T>) -> Vec<f32> {
    values.into_iter().map(Element::to_f32).collect()
}

impl<T: Element> Kernel for DirectConv<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let src = widen(cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?);
        let weights = widen(cx.arena.gather::<T>(pack.require(TensorRole::Weights)?)?);
        let bias = match pack.get(TensorRole::Bias) {
            Some(handle) => Some(widen(cx.arena.gather::<T>(handle)?)),
            None => None,
        };
        let g = self.geometry;
        let info = self.info;
        let mut out = vec![T::default(); g.batch * g.out_channels * g.out_height * g.out_width];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                let (batch, oc, oy, ox) = self.output_coords(offset + i);
                let mut acc = bias.as_ref().map_or(0.0, |bias| bias[oc]);
                for ky in 0..g.kernel_height {
                    let Some(y) = (oy * info.stride_y + ky).checked_sub(info.pad_top) else {
                        continue;
                    };
                    if y >= g.in_height {
                        continue;
                    }
                    for kx in 0..g.kernel_width {
                        let Some(x) = (ox * info.stride_x + kx).checked_sub(info.pad_left) else {
                            continue;
                        };
                        if x >= g.in_width {
                            continue;
                        }
                        for ic in 0..g.in_channels {
                            acc += src[self.input_index(batch, ic, y, x)]
                                * weights[self.weight_index(oc, ic, ky, kx)];
                        }
                    }
                }
                let acc = info.activation.map_or(acc, |function| function.apply(acc));
                *value = T::from_f32(acc);
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}
