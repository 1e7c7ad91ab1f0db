//! `[M, K] x [K, N]` matrix multiply.
//!
//! Every variant accumulates each output element over `k` in ascending order,
//! so the reference and blocked kernels agree exactly; the FMA variant only
//! differs by the rounding of the fused multiply-add.

use std::marker::PhantomData;

use half::f16;
use opgraph::error::Result;
use opgraph::kernels::{
    CpuFeature, Kernel, KernelConfig, KernelContext, KernelRegistry, KernelRequest, KernelVariant,
    TensorPack, TensorRole, Tiling, VariantRequirements,
};
use opgraph::ops::{ActivationFunction, OpKind, Operation};
use opgraph::tensor::{DataType, Element};

use super::wrong_operation;

/// Smallest extent on every axis for which blocking pays off.
const BLOCKED_MIN_EXTENT: usize = 16;

fn worth_blocking(request: &KernelRequest<'_>) -> bool {
    match (request.inputs.first(), request.inputs.get(1)) {
        (Some(lhs), Some(rhs)) => lhs
            .shape
            .dims()
            .iter()
            .chain(rhs.shape.dims())
            .all(|extent| *extent >= BLOCKED_MIN_EXTENT),
        _ => false,
    }
}

pub(super) fn register(registry: &mut KernelRegistry) {
    registry
        .register(KernelVariant::new(
            "matmul_reference",
            OpKind::MatMul,
            VariantRequirements::new().data_types([DataType::F32, DataType::F16]),
            |config| match config.inputs[0].data_type {
                DataType::F16 => ReferenceMatMul::<f16>::build(config),
                _ => ReferenceMatMul::<f32>::build(config),
            },
        ))
        .register(KernelVariant::new(
            "matmul_blocked",
            OpKind::MatMul,
            VariantRequirements::new()
                .data_types([DataType::F32])
                .predicate(worth_blocking),
            |config| BlockedMatMul::<false>::build("matmul_blocked", config),
        ))
        .register(KernelVariant::new(
            "matmul_blocked_fma",
            OpKind::MatMul,
            VariantRequirements::new()
                .data_types([DataType::F32])
                .feature(CpuFeature::Avx2)
                .feature(CpuFeature::Fma)
                .predicate(worth_blocking),
            |config| BlockedMatMul::<true>::build("matmul_blocked_fma", config),
        ));
}

#[derive(Debug, Clone, Copy)]
struct Extents {
    m: usize,
    k: usize,
    n: usize,
}

fn matmul_params(config: &KernelConfig) -> Result<(Extents, Option<ActivationFunction>)> {
    let Operation::MatMul { activation } = config.operation else {
        return Err(wrong_operation(OpKind::MatMul, config));
    };
    let lhs = config.inputs[0].shape.dims();
    let rhs = config.inputs[1].shape.dims();
    Ok((
        Extents {
            m: lhs[0],
            k: lhs[1],
            n: rhs[1],
        },
        activation,
    ))
}

fn finish(value: f32, activation: Option<ActivationFunction>) -> f32 {
    activation.map_or(value, |function| function.apply(value))
}

struct ReferenceMatMul<T> {
    dims: Extents,
    activation: Option<ActivationFunction>,
    chunk: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> ReferenceMatMul<T> {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let (dims, activation) = matmul_params(config)?;
        Ok(Box::new(ReferenceMatMul::<T> {
            dims,
            activation,
            chunk: config.tiling.chunk,
            _element: PhantomData,
        }))
    }
}

impl<T: Element> Kernel for ReferenceMatMul<T> {
    fn name(&self) -> &str {
        "matmul_reference"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let Extents { m, k, n } = self.dims;
        let lhs: Vec<f32> = cx
            .arena
            .gather::<T>(pack.require(TensorRole::Src(0))?)?
            .into_iter()
            .map(Element::to_f32)
            .collect();
        let rhs: Vec<f32> = cx
            .arena
            .gather::<T>(pack.require(TensorRole::Src(1))?)?
            .into_iter()
            .map(Element::to_f32)
            .collect();
        let mut out = vec![T::default(); m * n];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                let (row, col) = ((offset + i) / n, (offset + i) % n);
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += lhs[row * k + p] * rhs[p * n + col];
                }
                *value = T::from_f32(finish(acc, self.activation));
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

/// Row-panel kernel: each work item owns whole output rows and walks `k`
/// and `n` in cache-sized blocks.
struct BlockedMatMul<const FMA: bool> {
    name: &'static str,
    dims: Extents,
    activation: Option<ActivationFunction>,
    tiling: Tiling,
}

impl<const FMA: bool> BlockedMatMul<FMA> {
    fn build(name: &'static str, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let (dims, activation) = matmul_params(config)?;
        Ok(Box::new(BlockedMatMul::<FMA> {
            name,
            dims,
            activation,
            tiling: config.tiling,
        }))
    }
}

impl<const FMA: bool> Kernel for BlockedMatMul<FMA> {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let Extents { m, k, n } = self.dims;
        let lhs = cx.arena.gather::<f32>(pack.require(TensorRole::Src(0))?)?;
        let rhs = cx.arena.gather::<f32>(pack.require(TensorRole::Src(1))?)?;
        let block_k = self.tiling.block_k.max(1);
        let block_n = self.tiling.block_n.max(1);
        let rows_per_item = (self.tiling.chunk / n.max(1)).clamp(1, self.tiling.block_m.max(1));
        let mut out = vec![0.0f32; m * n];
        cx.scheduler.for_each_chunk(&mut out, rows_per_item * n, |offset, part| {
            let first_row = offset / n;
            for kk in (0..k).step_by(block_k) {
                let k_end = (kk + block_k).min(k);
                for jj in (0..n).step_by(block_n) {
                    let j_end = (jj + block_n).min(n);
                    for (r, out_row) in part.chunks_exact_mut(n).enumerate() {
                        let row = first_row + r;
                        for p in kk..k_end {
                            let a = lhs[row * k + p];
                            let b_row = &rhs[p * n..(p + 1) * n];
                            for j in jj..j_end {
                                out_row[j] = if FMA {
                                    a.mul_add(b_row[j], out_row[j])
                                } else {
                                    out_row[j] + a * b_row[j]
                                };
                            }
                        }
                    }
                }
            }
            if let Some(function) = self.activation {
                for value in part.iter_mut() {
                    *value = function.apply(*value);
                }
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}
