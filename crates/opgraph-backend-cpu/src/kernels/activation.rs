use std::marker::PhantomData;

use half::f16;
use opgraph::error::Result;
use opgraph::kernels::{
    Kernel, KernelConfig, KernelContext, KernelRegistry, KernelVariant, TensorPack,
    VariantRequirements,
};
use opgraph::ops::{ActivationFunction, OpKind, Operation};
use opgraph::tensor::{DataType, Element};

use super::{map_unary, wrong_operation};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry
        .register(KernelVariant::new(
            "activation_f32",
            OpKind::Activation,
            VariantRequirements::new().data_types([DataType::F32]),
            |config| ActivationKernel::<f32>::build("activation_f32", config),
        ))
        .register(KernelVariant::new(
            "activation_f16",
            OpKind::Activation,
            VariantRequirements::new().data_types([DataType::F16]),
            |config| ActivationKernel::<f16>::build("activation_f16", config),
        ));
}

struct ActivationKernel<T> {
    name: &'static str,
    function: ActivationFunction,
    chunk: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> ActivationKernel<T> {
    fn build(name: &'static str, config: &KernelConfig) -> Result<Box<dyn Kernel>> {
        let Operation::Activation(function) = config.operation else {
            return Err(wrong_operation(OpKind::Activation, config));
        };
        Ok(Box::new(ActivationKernel::<T> {
            name,
            function,
            chunk: config.tiling.chunk,
            _element: PhantomData,
        }))
    }
}

impl<T: Element> Kernel for ActivationKernel<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()> {
        let function = self.function;
        map_unary::<T, _>(pack, cx, self.chunk, move |x| function.apply(x))
    }
}
