use anyhow::Result;
use opgraph::graph::{GraphPrinter, NodeType, TensorBinding};
use opgraph::kernels::Capabilities;
use opgraph::ops::ActivationFunction;
use opgraph::{
    DataLayout, DataType, Graph, GraphBuilder, GraphConfig, HostTensor, TensorDescriptor, TensorId,
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

struct Concat {
    graph: Graph,
    inputs: Vec<TensorId>,
    branches: Vec<TensorId>,
    output: TensorId,
}

/// `concat(act(x_0), .., act(x_n))` along the channel axis of `layout`.
fn concat_of_activations(
    layout: DataLayout,
    batch: usize,
    height: usize,
    width: usize,
    channels: &[usize],
) -> Result<Concat> {
    let mut builder = GraphBuilder::new("depth_concat");
    let mut inputs = Vec::new();
    let mut branches = Vec::new();
    for (i, &c) in channels.iter().enumerate() {
        let dims = match layout {
            DataLayout::Nhwc => [batch, height, width, c],
            _ => [batch, c, height, width],
        };
        let x = builder.input(TensorDescriptor::new(dims, DataType::F32).with_layout(layout))?;
        let function = if i % 2 == 0 {
            ActivationFunction::Relu
        } else {
            ActivationFunction::Logistic
        };
        inputs.push(x);
        branches.push(builder.activation(x, function)?);
    }
    let output = builder.named("concat").depth_concatenate(&branches)?;
    builder.output(output)?;
    Ok(Concat {
        graph: builder.finish(),
        inputs,
        branches,
        output,
    })
}

fn run(concat: &mut Concat, config: &GraphConfig, data: &[Vec<f32>]) -> Result<(Vec<f32>, Vec<String>)> {
    let plan = concat
        .graph
        .finalize(&cpu_registry(), &Capabilities::portable(), config)?;
    for (tensor, values) in concat.inputs.iter().zip(data) {
        plan.write(*tensor, values.clone())?;
    }
    plan.run()?;
    let kernels = plan.kernel_names().into_iter().map(String::from).collect();
    Ok((plan.read::<f32>(concat.output)?, kernels))
}

fn random_inputs(rng: &mut StdRng, concat: &Concat) -> Vec<Vec<f32>> {
    concat
        .inputs
        .iter()
        .map(|id| {
            let len = concat.graph.descriptor(*id).map_or(0, TensorDescriptor::num_elements);
            (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect()
        })
        .collect()
}

#[test]
fn branches_write_straight_into_the_concat_output() -> Result<()> {
    init_tracing();
    let mut concat = concat_of_activations(DataLayout::Nchw, 1, 2, 2, &[3, 5])?;
    let data = vec![vec![1.0f32; 12], vec![-1.0f32; 20]];
    let (values, kernels) = run(&mut concat, &GraphConfig::default().with_threads(1), &data)?;

    let graph = &concat.graph;
    let origins: Vec<Vec<usize>> = concat
        .branches
        .iter()
        .map(|id| match graph.tensor(*id).map(|entry| entry.binding().clone()) {
            Ok(TensorBinding::SubTensor { parent, origin }) => {
                assert_eq!(parent, concat.output);
                origin.to_vec()
            }
            other => panic!("{id} is not a sub-tensor: {other:?}"),
        })
        .collect();
    assert_eq!(origins, [vec![0, 0, 0, 0], vec![0, 3, 0, 0]]);

    let concat_node = graph.nodes_of_type(NodeType::DepthConcatenate)[0];
    assert!(!graph.node(concat_node)?.is_enabled());
    assert!(!kernels.iter().any(|name| name == "concatenate"));

    let logistic = 1.0 / (1.0 + 1.0f32.exp());
    let mut expected = vec![1.0f32; 12];
    expected.extend(std::iter::repeat(logistic).take(20));
    assert_eq!(values, expected);

    let printed = GraphPrinter::render(graph);
    assert!(printed.contains("depth_concatenate"), "{printed}");
    assert!(printed.contains("[disabled]"), "{printed}");
    assert!(printed.contains("@t"), "{printed}");
    Ok(())
}

#[test]
fn sub_tensor_path_matches_copy_path_on_random_shapes() -> Result<()> {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..12 {
        let layout = if rng.gen_bool(0.5) {
            DataLayout::Nchw
        } else {
            DataLayout::Nhwc
        };
        let batch = rng.gen_range(1..=2);
        let (height, width) = (rng.gen_range(1..=4), rng.gen_range(1..=4));
        let channels: Vec<usize> = (0..rng.gen_range(2..=4))
            .map(|_| rng.gen_range(1..=5))
            .collect();

        let mut optimized = concat_of_activations(layout, batch, height, width, &channels)?;
        let mut reference = concat_of_activations(layout, batch, height, width, &channels)?;
        let data = random_inputs(&mut rng, &optimized);

        let threads = rng.gen_range(1..=3);
        let (fast, fast_kernels) = run(
            &mut optimized,
            &GraphConfig::default().with_threads(threads),
            &data,
        )?;
        let (slow, slow_kernels) = run(
            &mut reference,
            &GraphConfig::default().with_threads(threads).without_mutators(),
            &data,
        )?;
        assert_eq!(fast, slow, "{layout:?} {batch}x{height}x{width} {channels:?}");
        assert!(slow_kernels.iter().any(|name| name == "concatenate"));
        assert!(!fast_kernels.iter().any(|name| name == "concatenate"));
    }
    Ok(())
}

#[test]
fn shared_branch_keeps_the_copy() -> Result<()> {
    init_tracing();
    let mut builder = GraphBuilder::new("shared");
    let desc = TensorDescriptor::new([1, 2, 1, 2], DataType::F32).with_layout(DataLayout::Nchw);
    let x = builder.input(desc.clone())?;
    let y = builder.input(desc)?;
    let a = builder.activation(x, ActivationFunction::Relu)?;
    let b = builder.activation(y, ActivationFunction::Relu)?;
    let c = builder.depth_concatenate(&[a, b])?;
    builder.output(c)?;
    // A second reader of `a` forbids writing it into the concat output.
    builder.output(a)?;
    let mut graph = builder.finish();

    let plan = graph.finalize(
        &cpu_registry(),
        &Capabilities::portable(),
        &GraphConfig::default().with_threads(1),
    )?;
    assert!(matches!(graph.tensor(a)?.binding(), TensorBinding::Owned));
    assert!(matches!(graph.tensor(b)?.binding(), TensorBinding::Owned));
    assert!(plan.kernel_names().contains(&"concatenate"));

    plan.write(x, vec![1.0f32, -2.0, 3.0, -4.0])?;
    plan.write(y, vec![-5.0f32, 6.0, -7.0, 8.0])?;
    plan.run()?;
    assert_eq!(plan.read::<f32>(c)?, [1.0, 0.0, 3.0, 0.0, 0.0, 6.0, 0.0, 8.0]);
    assert_eq!(plan.read::<f32>(a)?, [1.0, 0.0, 3.0, 0.0]);
    Ok(())
}

#[test]
fn disabling_the_pass_by_name_keeps_the_copy() -> Result<()> {
    let mut concat = concat_of_activations(DataLayout::Nchw, 1, 1, 1, &[1, 1])?;
    let config = GraphConfig::default()
        .with_threads(1)
        .with_mutators(opgraph::MutatorSelection::Except(vec![
            "depth_concat_sub_tensor".to_string(),
        ]));
    let (values, kernels) = run(&mut concat, &config, &[vec![2.0], vec![0.0]])?;
    assert!(kernels.iter().any(|name| name == "concatenate"));
    assert_eq!(values, [2.0, 0.5]);
    Ok(())
}

#[test]
fn repeated_runs_leave_constant_and_input_branches_intact() -> Result<()> {
    init_tracing();
    let desc = TensorDescriptor::new([1, 2, 1, 1], DataType::F32).with_layout(DataLayout::Nchw);
    let mut builder = GraphBuilder::new("const_concat");
    let lhs = builder.constant(HostTensor::from_vec(desc.clone(), vec![1.0f32, 2.0])?)?;
    let x = builder.input(desc)?;
    let joined = builder.depth_concatenate(&[lhs, x])?;
    let out = builder.activation(joined, ActivationFunction::Tanh)?;
    builder.output(out)?;
    let mut graph = builder.finish();

    let plan = graph.finalize(&cpu_registry(), &Capabilities::portable(), &GraphConfig::default())?;
    assert!(matches!(graph.tensor(out)?.binding(), TensorBinding::Alias { .. }));
    assert!(matches!(graph.tensor(lhs)?.binding(), TensorBinding::Owned));
    assert!(plan.kernel_names().contains(&"concatenate"));

    let expected: Vec<f32> = [1.0f32, 2.0, 3.0, 4.0]
        .iter()
        .map(|v| ActivationFunction::Tanh.apply(*v))
        .collect();
    plan.write(x, vec![3.0f32, 4.0])?;
    for round in 0..3 {
        plan.run()?;
        assert_eq!(plan.read::<f32>(out)?, expected, "round {round}");
    }
    Ok(())
}
