//! Data movement: copy, strided slice, concatenation and reverse.
//!
//! These kernels only move elements, so one variant covers every storage type.

use opgraph::error::Result;
use opgraph::kernels::{
    Kernel, KernelConfig, KernelContext, KernelRegistry, KernelVariant, TensorPack, TensorRole,
    VariantRequirements,
};
use opgraph::ops::{OpKind, Operation, SliceAxis};
use opgraph::tensor::shape::contiguous_strides;
use opgraph::tensor::{Element, StorageKind};
use tracing::trace;

use super::{coordinate, storage_of, wrong_operation};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry
        .register(KernelVariant::new(
            "copy",
            OpKind::Copy,
            VariantRequirements::new(),
            |_| Ok(Box::new(CopyKernel) as Box<dyn Kernel>),
        ))
        .register(KernelVariant::new(
            "strided_slice",
            OpKind::StridedSlice,
            VariantRequirements::new(),
            StridedSliceKernel::build,
        ))
        .register(KernelVariant::new(
            "concatenate",
            OpKind::Concatenate,
            VariantRequirements::new(),
            ConcatKernel::build,
        ))
        .register(KernelVariant::new(
            "reverse",
            OpKind::Reverse,
            VariantRequirements::new(),
            ReverseKernel::build,
        ));
}

struct CopyKernel;

impl Kernel for CopyKernel {
    fn name(&self) -> &str {
        "copy"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let data = cx.arena.gather_data(pack.require(TensorRole::Src(0))?)?;
        cx.arena.scatter_data(pack.require(TensorRole::Dst)?, &data)
    }
}

struct StridedSliceKernel {
    kind: StorageKind,
    input_dims: Vec<usize>,
    axes: Vec<SliceAxis>,
    chunk: usize,
}

impl StridedSliceKernel {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let Operation::StridedSlice { axes } = &config.operation else {
            return Err(wrong_operation(OpKind::StridedSlice, config));
        };
        Ok(Box::new(StridedSliceKernel {
            kind: storage_of(config, 0)?,
            input_dims: config.inputs[0].shape.dims().to_vec(),
            axes: axes.clone(),
            chunk: config.tiling.chunk,
        }))
    }

    fn run_typed<T: Element>(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let src = cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?;
        let extents: Vec<usize> = self.axes.iter().map(|axis| axis.extent).collect();
        let in_strides = contiguous_strides(&self.input_dims);
        let out_strides = contiguous_strides(&extents);
        let mut out = vec![T::default(); extents.iter().product()];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                let index = offset + i;
                let source: usize = self
                    .axes
                    .iter()
                    .enumerate()
                    .map(|(axis, slice)| {
                        let at = coordinate(index, &out_strides, &extents, axis);
                        slice.source_index(at) * in_strides[axis]
                    })
                    .sum();
                *value = src[source];
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

impl Kernel for StridedSliceKernel {
    fn name(&self) -> &str {
        "strided_slice"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        with_storage!(self.kind, T => self.run_typed::<T>(pack, cx))
    }
}

struct ConcatKernel {
    kind: StorageKind,
    axis: usize,
    /// Extent of each input along `axis`.
    extents: Vec<usize>,
    outer: usize,
    inner: usize,
}

impl ConcatKernel {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let Operation::Concatenate { axis } = config.operation else {
            return Err(wrong_operation(OpKind::Concatenate, config));
        };
        let dims = config.output.shape.dims();
        Ok(Box::new(ConcatKernel {
            kind: storage_of(config, 0)?,
            axis,
            extents: config
                .inputs
                .iter()
                .map(|desc| desc.shape.dims()[axis])
                .collect(),
            outer: dims[..axis].iter().product(),
            inner: dims[axis + 1..].iter().product(),
        }))
    }

    fn run_typed<T: Element>(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let parts = (0..self.extents.len())
            .map(|i| cx.arena.gather::<T>(pack.require(TensorRole::Src(i))?))
            .collect::<Result<Vec<_>>>()?;
        let total: usize = self.extents.iter().sum::<usize>() * self.outer * self.inner;
        let mut out = Vec::with_capacity(total);
        for o in 0..self.outer {
            for (part, extent) in parts.iter().zip(&self.extents) {
                let len = extent * self.inner;
                out.extend_from_slice(&part[o * len..(o + 1) * len]);
            }
        }
        trace!(axis = self.axis, inputs = parts.len(), "concatenate");
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

impl Kernel for ConcatKernel {
    fn name(&self) -> &str {
        "concatenate"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        with_storage!(self.kind, T => self.run_typed::<T>(pack, cx))
    }
}

struct ReverseKernel {
    kind: StorageKind,
    dims: Vec<usize>,
    flipped: Vec<bool>,
    chunk: usize,
}

impl ReverseKernel {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let Operation::Reverse { axes } = &config.operation else {
            return Err(wrong_operation(OpKind::Reverse, config));
        };
        let dims = config.inputs[0].shape.dims().to_vec();
        let flipped = (0..dims.len()).map(|axis| axes.contains(&axis)).collect();
        Ok(Box::new(ReverseKernel {
            kind: storage_of(config, 0)?,
            dims,
            flipped,
            chunk: config.tiling.chunk,
        }))
    }

    fn run_typed<T: Element>(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let src = cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?;
        let strides = contiguous_strides(&self.dims);
        let mut out = vec![T::default(); src.len()];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                let index = offset + i;
                let mut source = 0;
                for axis in 0..self.dims.len() {
                    let at = coordinate(index, &strides, &self.dims, axis);
                    let at = if self.flipped[axis] {
                        self.dims[axis] - 1 - at
                    } else {
                        at
                    };
                    source += at * strides[axis];
                }
                *value = src[source];
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

impl Kernel for ReverseKernel {
    fn name(&self) -> &str {
        "reverse"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        with_storage!(self.kind, T => self.run_typed::<T>(pack, cx))
    }
}
