use anyhow::Result;
use opgraph::functions::Function;
use opgraph::kernels::{
    Capabilities, CpuFeature, Kernel, KernelConfig, KernelContext, KernelRegistry, KernelRequest,
    KernelVariant, TensorPack, VariantRequirements,
};
use opgraph::ops::{ConvInfo, OpKind, Operation};
use opgraph::{DataLayout, DataType, GraphBuilder, GraphConfig, GraphError, TensorDescriptor};
use opgraph_backend_cpu::cpu_registry;

struct Named(&'static str);

impl Kernel for Named {
    fn name(&self) -> &str {
        self.0
    }

    fn run(&self, _pack: &TensorPack, _cx: &mut KernelContext<'_>) -> Result<(), GraphError> {
        Ok(())
    }
}

fn variant(name: &'static str, requirements: VariantRequirements) -> KernelVariant {
    KernelVariant::new(name, OpKind::Copy, requirements, move |_: &KernelConfig| {
        Ok(Box::new(Named(name)) as Box<dyn Kernel>)
    })
}

fn select_copy(registry: &KernelRegistry, caps: &Capabilities, data_type: DataType) -> Result<String> {
    let desc = TensorDescriptor::new([8], data_type);
    let inputs = [desc.clone()];
    let request = KernelRequest::new(&Operation::Copy, &inputs, &desc);
    Ok(registry.select(&request, caps)?.name().to_string())
}

#[test]
fn equal_rank_goes_to_the_first_registered() -> Result<()> {
    let mut registry = KernelRegistry::new();
    registry
        .register(variant("first", VariantRequirements::new()))
        .register(variant("second", VariantRequirements::new()));
    for _ in 0..3 {
        assert_eq!(select_copy(&registry, &Capabilities::portable(), DataType::F32)?, "first");
    }
    Ok(())
}

#[test]
fn feature_tier_outranks_constraints_and_order() -> Result<()> {
    let mut registry = KernelRegistry::new();
    registry
        .register(variant(
            "typed",
            VariantRequirements::new().data_types([DataType::F32]),
        ))
        .register(variant("sse", VariantRequirements::new().feature(CpuFeature::Sse41)))
        .register(variant("avx2", VariantRequirements::new().feature(CpuFeature::Avx2)))
        .register(variant("generic", VariantRequirements::new()));

    let portable = Capabilities::portable();
    assert_eq!(select_copy(&registry, &portable, DataType::F32)?, "typed");
    assert_eq!(select_copy(&registry, &portable, DataType::S8)?, "generic");

    let sse = portable.clone().with_feature(CpuFeature::Sse41);
    assert_eq!(select_copy(&registry, &sse, DataType::F32)?, "sse");

    let both = sse.with_feature(CpuFeature::Avx2);
    assert_eq!(select_copy(&registry, &both, DataType::F32)?, "avx2");
    Ok(())
}

#[test]
fn missing_feature_reports_every_rejection() -> Result<()> {
    let mut registry = KernelRegistry::new();
    registry.register(variant("neon_only", VariantRequirements::new().feature(CpuFeature::Neon)));
    let desc = TensorDescriptor::new([4], DataType::F32);

    let err = Function::validate(
        &registry,
        &Capabilities::portable(),
        &Operation::Copy,
        &[desc.clone()],
        &desc,
    )
    .unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    assert!(err.to_string().contains("neon_only"), "{err}");

    Function::validate(
        &registry,
        &Capabilities::portable().with_feature(CpuFeature::Neon),
        &Operation::Copy,
        &[desc.clone()],
        &desc,
    )?;
    Ok(())
}

#[test]
fn integer_convolution_has_no_kernel() -> Result<()> {
    let input = TensorDescriptor::new([1, 1, 4, 4], DataType::S32).with_layout(DataLayout::Nchw);
    let weights = TensorDescriptor::new([1, 1, 3, 3], DataType::S32);
    let output = TensorDescriptor::new([1, 1, 2, 2], DataType::S32).with_layout(DataLayout::Nchw);
    let err = Function::validate(
        &cpu_registry(),
        &Capabilities::portable(),
        &Operation::Convolution(ConvInfo::default()),
        &[input, weights],
        &output,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        GraphError::UnsupportedConfiguration {
            op: OpKind::Convolution,
            ..
        }
    ));
    Ok(())
}

#[test]
fn malformed_operation_fails_before_dispatch() {
    let input = TensorDescriptor::new([2, 3], DataType::F32);
    let err = Function::validate(
        &cpu_registry(),
        &Capabilities::portable(),
        &Operation::Copy,
        &[input],
        &TensorDescriptor::new([5], DataType::F32),
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::ShapeMismatch { .. }), "{err}");
}

fn matmul_kernels(caps: &Capabilities, m: usize, k: usize, n: usize) -> Result<Vec<String>> {
    let mut builder = GraphBuilder::new("matmul");
    let lhs = builder.input(TensorDescriptor::new([m, k], DataType::F32))?;
    let rhs = builder.input(TensorDescriptor::new([k, n], DataType::F32))?;
    let out = builder.matmul(lhs, rhs)?;
    builder.output(out)?;
    let mut graph = builder.finish();
    let plan = graph.finalize(&cpu_registry(), caps, &GraphConfig::default().with_threads(1))?;
    Ok(plan.kernel_names().into_iter().map(String::from).collect())
}

#[test]
fn matmul_selection_is_stable_across_finalizations() -> Result<()> {
    let fma = Capabilities::portable().with_features([CpuFeature::Avx2, CpuFeature::Fma]);
    let first = matmul_kernels(&fma, 32, 32, 32)?;
    for _ in 0..4 {
        assert_eq!(matmul_kernels(&fma, 32, 32, 32)?, first);
    }
    assert_eq!(first, ["matmul_blocked_fma"]);

    assert_eq!(matmul_kernels(&fma, 4, 32, 32)?, ["matmul_reference"]);
    assert_eq!(
        matmul_kernels(&Capabilities::portable(), 32, 32, 32)?,
        ["matmul_blocked"]
    );
    Ok(())
}

#[test]
fn restricted_capabilities_fall_back_to_portable_kernels() -> Result<()> {
    let caps = Capabilities::portable()
        .with_features([CpuFeature::Avx2, CpuFeature::Fma])
        .restricted_to(&["none".to_string()]);
    assert!(caps.features().is_empty());
    assert_eq!(matmul_kernels(&caps, 32, 32, 32)?, ["matmul_blocked"]);

    let caps = Capabilities::portable()
        .with_features([CpuFeature::Avx2, CpuFeature::Fma])
        .restricted_to(&["avx2".to_string()]);
    assert!(caps.has(CpuFeature::Avx2) && !caps.has(CpuFeature::Fma));
    assert_eq!(matmul_kernels(&caps, 32, 32, 32)?, ["matmul_blocked"]);
    Ok(())
}
