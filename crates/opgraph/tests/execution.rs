use anyhow::Result;
use opgraph::graph::{NodeKind, NodeState, NodeType, TensorBinding};
use opgraph::kernels::Capabilities;
use opgraph::ops::{ActivationFunction, ConvInfo, ElementwiseOp};
use opgraph::tensor::QuantizationInfo;
use opgraph::{
    DataLayout, DataType, ExecutionMode, Graph, GraphBuilder, GraphConfig, GraphError, HostTensor,
    TensorDescriptor, TensorId,
};
use opgraph_backend_cpu::cpu_registry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// `tanh(logistic(x + x))`
fn elementwise_chain() -> Result<(Graph, TensorId, TensorId)> {
    let mut builder = GraphBuilder::new("chain");
    let x = builder.input(TensorDescriptor::new([3, 5], DataType::F32))?;
    let sum = builder.elementwise(ElementwiseOp::Add, x, x)?;
    let squashed = builder.activation(sum, ActivationFunction::Logistic)?;
    let out = builder.activation(squashed, ActivationFunction::Tanh)?;
    builder.output(out)?;
    Ok((builder.finish(), x, out))
}

#[test]
fn activation_fusion_and_in_place_keep_results() -> Result<()> {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(42);
    let input = random_vec(&mut rng, 15);
    let registry = cpu_registry();
    let caps = Capabilities::portable();

    let (mut reference, x, out) = elementwise_chain()?;
    let plain = reference.finalize(&registry, &caps, &GraphConfig::default().without_mutators())?;
    plain.write(x, input.clone())?;
    plain.run()?;

    let (mut graph, x, out_fused) = elementwise_chain()?;
    assert_eq!(out, out_fused);
    let plan = graph.finalize(&registry, &caps, &GraphConfig::default())?;
    plan.write(x, input.clone())?;
    plan.run()?;

    assert_eq!(graph.nodes_of_type(NodeType::Activation).len(), 1);
    let fused = graph.nodes_of_type(NodeType::Elementwise)[0];
    assert!(matches!(
        graph.node(fused)?.kind(),
        NodeKind::Elementwise {
            activation: Some(ActivationFunction::Logistic),
            ..
        }
    ));
    assert!(matches!(graph.tensor(out)?.binding(), TensorBinding::Alias { .. }));
    assert_eq!(plan.num_functions(), 2);
    assert!(plan.live_buffers() < plain.live_buffers());

    let expected: Vec<f32> = input
        .iter()
        .map(|v| ActivationFunction::Tanh.apply(ActivationFunction::Logistic.apply(v + v)))
        .collect();
    assert_eq!(plain.read::<f32>(out)?, expected);
    assert_eq!(plan.read::<f32>(out)?, expected);
    Ok(())
}

#[test]
fn matmul_absorbs_trailing_relu() -> Result<()> {
    let mut builder = GraphBuilder::new("mlp");
    let lhs = builder.input(TensorDescriptor::new([2, 3], DataType::F32))?;
    let rhs = builder.constant(HostTensor::from_vec(
        TensorDescriptor::new([3, 2], DataType::F32),
        vec![1.0f32, -1.0, 2.0, 0.0, -3.0, 1.0],
    )?)?;
    let product = builder.matmul(lhs, rhs)?;
    let out = builder.activation(product, ActivationFunction::Relu)?;
    builder.output(out)?;
    let mut graph = builder.finish();

    let plan = graph.finalize(&cpu_registry(), &Capabilities::portable(), &GraphConfig::default())?;
    assert_eq!(plan.kernel_names(), ["matmul_reference"]);
    assert!(graph.nodes_of_type(NodeType::Activation).is_empty());

    plan.write(lhs, vec![1.0f32, 1.0, 1.0, 0.0, 0.0, 1.0])?;
    plan.run()?;
    // rows: [1 + 2 - 3, -1 + 0 + 1] and [-3, 1]
    assert_eq!(plan.read::<f32>(out)?, [0.0, 0.0, 0.0, 1.0]);
    Ok(())
}

fn conv_block(layout: DataLayout) -> Result<(Graph, TensorId, TensorId)> {
    let (input_dims, weight_dims) = match layout {
        DataLayout::Nhwc => ([2, 6, 5, 3], [4, 3, 3, 3]),
        _ => ([2, 3, 6, 5], [4, 3, 3, 3]),
    };
    let mut rng = StdRng::seed_from_u64(7);
    let mut builder = GraphBuilder::new("conv");
    let x = builder.input(TensorDescriptor::new(input_dims, DataType::F32).with_layout(layout))?;
    let w = builder.constant(HostTensor::from_vec(
        TensorDescriptor::new(weight_dims, DataType::F32),
        random_vec(&mut rng, 4 * 3 * 3 * 3),
    )?)?;
    let b = builder.constant(HostTensor::from_vec(
        TensorDescriptor::new([4], DataType::F32),
        random_vec(&mut rng, 4),
    )?)?;
    let y = builder.convolution(x, w, Some(b), ConvInfo::new((1, 2), (1, 1, 1, 1)))?;
    let y = builder.activation(y, ActivationFunction::BoundedRelu { upper: 0.5 })?;
    let flat = builder.flatten(y)?;
    builder.output(flat)?;
    Ok((builder.finish(), x, flat))
}

#[test]
fn queued_execution_matches_immediate() -> Result<()> {
    init_tracing();
    let registry = cpu_registry();
    let caps = Capabilities::portable().with_threads(3);
    let mut rng = StdRng::seed_from_u64(99);
    for layout in [DataLayout::Nchw, DataLayout::Nhwc] {
        let (mut immediate_graph, x, out) = conv_block(layout)?;
        let (mut queued_graph, _, _) = conv_block(layout)?;
        let immediate = immediate_graph.finalize(&registry, &caps, &GraphConfig::default())?;
        let queued = queued_graph.finalize(
            &registry,
            &caps,
            &GraphConfig::default().with_execution_mode(ExecutionMode::Queued),
        )?;
        assert_eq!(queued_graph.descriptor(out).map(|d| d.shape.dims().to_vec()), Some(vec![2, 4 * 3 * 5]));

        // Two rounds so the queued plan sees a second input after the first sync.
        for _ in 0..2 {
            let input = random_vec(&mut rng, 2 * 3 * 6 * 5);
            immediate.write(x, input.clone())?;
            immediate.run()?;
            queued.write(x, input)?;
            queued.run()?;
            queued.sync()?;
            assert_eq!(queued.read::<f32>(out)?, immediate.read::<f32>(out)?, "{layout:?}");
        }
    }
    Ok(())
}

#[test]
fn dequantize_reverse_flatten_pipeline() -> Result<()> {
    let mut builder = GraphBuilder::new("pipeline");
    let desc = TensorDescriptor::new([1, 2, 3], DataType::QAsymm8)
        .with_quant(QuantizationInfo::uniform(0.5, 10));
    let q = builder.input(desc.clone())?;
    let real = builder.dequantize(q, DataType::F32)?;
    // Inverted axis 0 of rank 3 is axis 2.
    let reversed = builder.reverse(real, &[0], true)?;
    let flat = builder.flatten(reversed)?;
    builder.output(flat)?;
    let mut graph = builder.finish();

    let plan = graph.finalize(&cpu_registry(), &Capabilities::portable(), &GraphConfig::default())?;
    plan.set_input(q, &HostTensor::from_vec(desc, vec![10u8, 12, 14, 20, 8, 0])?)?;
    plan.run()?;
    let out = plan.output(flat)?;
    assert_eq!(out.desc.shape.dims(), &[1, 6]);
    assert_eq!(out.as_slice::<f32>(), Some(&[2.0, 1.0, 0.0, -5.0, -1.0, 5.0][..]));
    Ok(())
}

#[test]
fn set_input_rejects_foreign_shapes() -> Result<()> {
    let (mut graph, x, _) = elementwise_chain()?;
    let plan = graph.finalize(&cpu_registry(), &Capabilities::portable(), &GraphConfig::default())?;
    let wrong = HostTensor::from_vec(TensorDescriptor::new([5, 3], DataType::F32), vec![0.0f32; 15])?;
    assert!(plan.set_input(x, &wrong).is_err());
    assert!(plan.write(x, vec![0i32; 15]).is_err());
    Ok(())
}

#[test]
fn forward_descriptors_is_idempotent() -> Result<()> {
    let (mut graph, _, _) = conv_block(DataLayout::Nchw)?;
    graph.forward_descriptors()?;
    let first: Vec<_> = graph.tensors().map(|entry| entry.descriptor().cloned()).collect();
    graph.forward_descriptors()?;
    let second: Vec<_> = graph.tensors().map(|entry| entry.descriptor().cloned()).collect();
    assert_eq!(first, second);
    assert!(graph
        .nodes()
        .all(|node| node.state() == NodeState::DescriptorsResolved));
    Ok(())
}

#[test]
fn descriptors_serialize_with_layout_and_quantization() -> Result<()> {
    let desc = TensorDescriptor::new([1, 4, 2, 2], DataType::QSymm8PerChannel)
        .with_layout(DataLayout::Nchw)
        .with_quant(QuantizationInfo::per_channel(vec![0.5, 1.0, 1.5, 2.0], vec![])?);
    let json = serde_json::to_value(&desc)?;
    assert_eq!(json["data_type"], "QSymm8PerChannel");
    assert_eq!(json["layout"], "Nchw");
    let back: TensorDescriptor = serde_json::from_value(json)?;
    assert_eq!(back, desc);
    assert_eq!(desc.to_string(), "tensor<QSymm8PerChannel, 1x4x2x2, Nchw, q[4]>");
    Ok(())
}

#[test]
fn mismatched_elementwise_operands_fail_at_build_time() -> Result<()> {
    let mut builder = GraphBuilder::new("bad");
    let a = builder.input(TensorDescriptor::new([2, 3], DataType::F32))?;
    let b = builder.input(TensorDescriptor::new([3, 2], DataType::F32))?;
    let err = builder.elementwise(ElementwiseOp::Add, a, b).unwrap_err();
    assert!(matches!(err, GraphError::ShapeMismatch { .. }), "{err}");
    Ok(())
}

#[test]
fn connecting_a_cycle_is_rejected() -> Result<()> {
    let mut graph = Graph::new("cycle");
    let first = graph.add_node(NodeKind::Activation(ActivationFunction::Relu), 1)?;
    let second = graph.add_node(NodeKind::Activation(ActivationFunction::Relu), 1)?;
    let first_out = graph.node(first)?.outputs()[0];
    let second_out = graph.node(second)?.outputs()[0];
    graph.connect(first_out, second, 0)?;
    let err = graph.connect(second_out, first, 0).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }), "{err}");
    assert_eq!(graph.consumers(second_out)?.len(), 0);
    Ok(())
}
