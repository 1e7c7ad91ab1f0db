//! Kernel bodies and their registration.
//!
//! Every kernel gathers its source windows into dense vectors, computes the
//! dense output over disjoint chunks on the plan's scheduler and scatters the
//! result into the destination window. Sub-tensor destinations therefore need
//! no special casing.

use opgraph::error::{GraphError, Result};
use opgraph::kernels::{KernelConfig, KernelContext, KernelRegistry, TensorPack, TensorRole};
use opgraph::ops::OpKind;
use opgraph::tensor::{Element, StorageKind};

/// Runs `$body` with `$t` bound to the element type of `$kind`.
macro_rules! with_storage {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            StorageKind::U8 => {
                type $t = u8;
                $body
            }
            StorageKind::I8 => {
                type $t = i8;
                $body
            }
            StorageKind::U16 => {
                type $t = u16;
                $body
            }
            StorageKind::I16 => {
                type $t = i16;
                $body
            }
            StorageKind::U32 => {
                type $t = u32;
                $body
            }
            StorageKind::I32 => {
                type $t = i32;
                $body
            }
            StorageKind::F16 => {
                type $t = half::f16;
                $body
            }
            StorageKind::F32 => {
                type $t = f32;
                $body
            }
        }
    };
}

mod activation;
mod conv;
mod dequantize;
mod elementwise;
mod matmul;
mod movement;

pub(crate) fn register_all(registry: &mut KernelRegistry) {
    movement::register(registry);
    activation::register(registry);
    elementwise::register(registry);
    matmul::register(registry);
    conv::register(registry);
    dequantize::register(registry);
}

/// Error for a factory handed an operation it was not registered for.
fn wrong_operation(expected: OpKind, config: &KernelConfig) -> GraphError {
    GraphError::unsupported(
        expected,
        format!("kernel built for {:?}", config.operation.kind()),
    )
}

/// Applies `f` to every element of `Src(0)` and writes `Dst`.
fn map_unary<T, F>(pack: &TensorPack, cx: &mut KernelContext<'_>, chunk: usize, f: F) -> Result<()>
where
    T: Element,
    F: Fn(f32) -> f32 + Send + Sync,
{
    let src = cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?;
    let mut out = vec![T::default(); src.len()];
    cx.scheduler.for_each_chunk(&mut out, chunk, |offset, part| {
        for (value, input) in part.iter_mut().zip(&src[offset..]) {
            *value = T::from_f32(f(input.to_f32()));
        }
    });
    cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
}

/// Row-major coordinate of flat `index` along `axis`.
fn coordinate(index: usize, strides: &[usize], dims: &[usize], axis: usize) -> usize {
    (index / strides[axis]) % dims[axis].max(1)
}

fn storage_of(config: &KernelConfig, input: usize) -> Result<StorageKind> {
    config
        .inputs
        .get(input)
        .map(|desc| desc.data_type.storage_kind())
        .ok_or_else(|| {
            GraphError::invalid_argument(format!(
                "{:?} kernel needs input {input}",
                config.operation.kind()
            ))
        })
}
