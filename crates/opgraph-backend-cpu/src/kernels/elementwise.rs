//! Binary elementwise kernels.
//!
//! Float variants evaluate in `f32`; the wide variants walk the output in
//! fixed-width lane blocks so the inner loop has a constant trip count.
//! Integer data takes a separate path with saturating arithmetic.

use std::marker::PhantomData;

use half::f16;
use opgraph::error::{GraphError, Result};
use opgraph::kernels::{
    CpuFeature, Kernel, KernelConfig, KernelContext, KernelRegistry, KernelVariant, TensorPack,
    TensorRole, VariantRequirements,
};
use opgraph::ops::{ActivationFunction, ElementwiseOp, OpKind, Operation};
use opgraph::tensor::{DataType, Element, StorageKind};

use super::{storage_of, wrong_operation};

const INTEGER_TYPES: [DataType; 6] = [
    DataType::U8,
    DataType::S8,
    DataType::U16,
    DataType::S16,
    DataType::U32,
    DataType::S32,
];

pub(super) fn register(registry: &mut KernelRegistry) {
    registry
        .register(KernelVariant::new(
            "elementwise_f32",
            OpKind::Elementwise,
            VariantRequirements::new().data_types([DataType::F32]),
            |config| FloatElementwise::<f32, 1>::build("elementwise_f32", config),
        ))
        .register(KernelVariant::new(
            "elementwise_f16",
            OpKind::Elementwise,
            VariantRequirements::new().data_types([DataType::F16]),
            |config| FloatElementwise::<f16, 1>::build("elementwise_f16", config),
        ))
        .register(KernelVariant::new(
            "elementwise_f32_neon",
            OpKind::Elementwise,
            VariantRequirements::new()
                .data_types([DataType::F32])
                .feature(CpuFeature::Neon),
            |config| FloatElementwise::<f32, 4>::build("elementwise_f32_neon", config),
        ))
        .register(KernelVariant::new(
            "elementwise_f32_avx2",
            OpKind::Elementwise,
            VariantRequirements::new()
                .data_types([DataType::F32])
                .feature(CpuFeature::Avx2),
            |config| FloatElementwise::<f32, 8>::build("elementwise_f32_avx2", config),
        ))
        .register(KernelVariant::new(
            "elementwise_int",
            OpKind::Elementwise,
            VariantRequirements::new().data_types(INTEGER_TYPES),
            IntegerElementwise::build,
        ));
}

fn elementwise_params(config: &KernelConfig) -> Result<(ElementwiseOp, Option<ActivationFunction>)> {
    match config.operation {
        Operation::Elementwise { op, activation } => Ok((op, activation)),
        _ => Err(wrong_operation(OpKind::Elementwise, config)),
    }
}

struct FloatElementwise<T, const LANES: usize> {
    name: &'static str,
    op: ElementwiseOp,
    activation: Option<ActivationFunction>,
    chunk: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element, const LANES: usize> FloatElementwise<T, LANES> {
    fn build(name: &'static str, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let (op, activation) = elementwise_params(config)?;
        if op == ElementwiseOp::BitwiseXor {
            return Err(GraphError::unsupported(
                OpKind::Elementwise,
                "bitwise xor needs integer data",
            ));
        }
        Ok(Box::new(FloatElementwise::<T, LANES> {
            name,
            op,
            activation,
            chunk: config.tiling.chunk,
            _element: PhantomData,
        }))
    }

    #[inline]
    fn eval(&self, lhs: T, rhs: T) -> T {
        let value = self.op.apply_f32(lhs.to_f32(), rhs.to_f32());
        T::from_f32(self.activation.map_or(value, |function| function.apply(value)))
    }
}

impl<T: Element, const LANES: usize> Kernel for FloatElementwise<T, LANES> {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let lhs = cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?;
        let rhs = cx.arena.gather::<T>(pack.require(TensorRole::Src(1))?)?;
        let mut out = vec![T::default(); lhs.len()];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            let mut index = offset;
            let mut blocks = part.chunks_exact_mut(LANES);
            for block in &mut blocks {
                for lane in 0..LANES {
                    block[lane] = self.eval(lhs[index + lane], rhs[index + lane]);
                }
                index += LANES;
            }
            for (i, value) in blocks.into_remainder().iter_mut().enumerate() {
                *value = self.eval(lhs[index + i], rhs[index + i]);
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

/// Integer element types with exact widening to `i64`.
trait IntElement: Element {
    fn widen(self) -> i64;
    fn saturate(value: i64) -> Self;
    fn xor(self, rhs: Self) -> Self;
}

macro_rules! impl_int_element {
    ($($ty:ty),*) => {
        $(
            impl IntElement for $ty {
                fn widen(self) -> i64 {
                    self as i64
                }

                fn saturate(value: i64) -> Self {
                    value.clamp(<$ty>::MIN as i64, <$ty>::MAX as i64) as $ty
                }

                fn xor(self, rhs: Self) -> Self {
                    self ^ rhs
                }
            }
        )*
    };
}

impl_int_element!(u8, i8, u16, i16, u32, i32);

fn apply_int<T: IntElement>(op: ElementwiseOp, lhs: T, rhs: T) -> T {
    let (a, b) = (lhs.widen(), rhs.widen());
    match op {
        ElementwiseOp::Add => T::saturate(a + b),
        ElementwiseOp::Sub => T::saturate(a - b),
        ElementwiseOp::Mul => T::saturate(a.saturating_mul(b)),
        ElementwiseOp::Max => T::saturate(a.max(b)),
        ElementwiseOp::Min => T::saturate(a.min(b)),
        ElementwiseOp::BitwiseXor => lhs.xor(rhs),
    }
}

struct IntegerElementwise {
    kind: StorageKind,
    op: ElementwiseOp,
    chunk: usize,
}

impl IntegerElementwise {
    fn build(config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let (op, activation) = elementwise_params(config)?;
        if activation.is_some() {
            return Err(GraphError::unsupported(
                OpKind::Elementwise,
                "fused activation on integer data",
            ));
        }
        Ok(Box::new(IntegerElementwise {
            kind: storage_of(config, 0)?,
            op,
            chunk: config.tiling.chunk,
        }))
    }

    fn run_typed<T: IntElement>(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let lhs = cx.arena.gather::<T>(pack.require(TensorRole::Src(0))?)?;
        let rhs = cx.arena.gather::<T>(pack.require(TensorRole::Src(1))?)?;
        let mut out = vec![T::default(); lhs.len()];
        cx.scheduler.for_each_chunk(&mut out, self.chunk, |offset, part| {
            for (i, value) in part.iter_mut().enumerate() {
                *value = apply_int(self.op, lhs[offset + i], rhs[offset + i]);
            }
        });
        cx.arena.scatter(pack.require(TensorRole::Dst)?, &out)
    }
}

impl Kernel for IntegerElementwise {
    fn name(&self) -> &str {
        "elementwise_int"
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        match self.kind {
            StorageKind::U8 => self.run_typed::<u8>(pack, cx),
            StorageKind::I8 => self.run_typed::<i8>(pack, cx),
            StorageKind::U16 => self.run_typed::<u16>(pack, cx),
            StorageKind::I16 => self.run_typed::<i16>(pack, cx),
            StorageKind::U32 => self.run_typed::<u32>(pack, cx),
            StorageKind::I32 => self.run_typed::<i32>(pack, cx),
            StorageKind::F16 | StorageKind::F32 => Err(GraphError::execution(
                "integer elementwise kernel bound to float storage",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_saturates() {
        assert_eq!(apply_int(ElementwiseOp::Add, 200u8, 100u8), 255);
        assert_eq!(apply_int(ElementwiseOp::Sub, -100i8, 100i8), -128);
        assert_eq!(apply_int(ElementwiseOp::Mul, u32::MAX, 2u32), u32::MAX);
        assert_eq!(apply_int(ElementwiseOp::BitwiseXor, 0b1100u16, 0b1010u16), 0b0110);
    }
}
