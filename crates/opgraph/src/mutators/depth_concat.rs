use smallvec::SmallVec;
use tracing::debug;

use super::{GraphMutator, MutationResult, MutationType};
use crate::error::Result;
use crate::graph::nodes::concat;
use crate::graph::{Graph, Node, NodeType, TensorBinding, TensorId};
use crate::tensor::Dims;

/// Turns depth concatenations into sub-tensor windows of their output.
///
/// When every input is written by a single producer and read only by the
/// concatenation, each input is bound to its slice of the output's storage
/// and the concatenation node is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DepthConcatSubTensorMutator;

impl DepthConcatSubTensorMutator {
    const NAME: &'static str = "depth_concat_sub_tensor";
}

enum Decision {
    Rewrite {
        output: TensorId,
        windows: Vec<(TensorId, Dims)>,
    },
    Keep(String),
}

impl GraphMutator for DepthConcatSubTensorMutator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Backend
    }

    fn mutate(&self, graph: &mut Graph) -> Result<MutationResult> {
        let mut order = graph.topological_order()?;
        // Consumers first, so an inner concatenation sees the window its
        // output was given by an outer one.
        order.reverse();
        let mut rewritten = 0;
        for id in order {
            let node = graph.node(id)?;
            if node.node_type() != NodeType::DepthConcatenate {
                continue;
            }
            match decide(graph, node)? {
                Decision::Keep(reason) => {
                    debug!(node = %node.label(), %reason, "depth concatenation kept");
                }
                Decision::Rewrite { output, windows } => {
                    debug!(node = %node.label(), inputs = windows.len(), "depth concatenation elided");
                    for (tensor, origin) in windows {
                        graph.set_binding(
                            tensor,
                            TensorBinding::SubTensor {
                                parent: output,
                                origin,
                            },
                        )?;
                    }
                    graph.set_enabled(id, false)?;
                    rewritten += 1;
                }
            }
        }
        Ok(MutationResult::rewritten(rewritten))
    }
}

fn decide(graph: &Graph, node: &Node) -> Result<Decision> {
    let keep = |reason: String| -> Result<Decision> { Ok(Decision::Keep(reason)) };
    if !node.is_enabled() {
        return keep("node is disabled".into());
    }
    let Some(output) = node.output(0) else {
        return keep("no output tensor".into());
    };
    let out_entry = graph.tensor(output)?;
    let Some(out_desc) = out_entry.descriptor() else {
        return keep(format!("{output} has no descriptor"));
    };
    if matches!(out_entry.binding(), TensorBinding::Alias { .. }) {
        return keep(format!("{output} aliases another tensor"));
    }
    let Some(axis) = out_desc.depth_axis() else {
        return keep(format!("{out_desc} has no depth axis"));
    };
    let Some(inputs) = node.bound_inputs() else {
        return keep("an input slot is unbound".into());
    };

    let mut descs = Vec::with_capacity(inputs.len());
    let mut reads_caller_data = false;
    for &tensor in &inputs {
        let entry = graph.tensor(tensor)?;
        if !matches!(entry.consumers(), [(consumer, _)] if *consumer == node.id()) {
            return keep(format!("{tensor} has other consumers"));
        }
        if entry.binding() != &TensorBinding::Owned {
            return keep(format!("{tensor} does not own its storage"));
        }
        let Some((producer, _)) = entry.producer() else {
            return keep(format!("{tensor} has no producer"));
        };
        let Some(desc) = entry.descriptor() else {
            return keep(format!("{tensor} has no descriptor"));
        };
        if !desc.same_element_format(out_desc) || !desc.shape.matches_except(&out_desc.shape, axis) {
            return keep(format!("{tensor} ({desc}) does not tile {out_desc}"));
        }
        reads_caller_data |= matches!(
            graph.node(producer)?.node_type(),
            NodeType::Input | NodeType::Const
        );
        descs.push(desc);
    }
    let depth: usize = descs.iter().map(|desc| desc.shape.dims()[axis]).sum();
    if depth != out_desc.shape.dims()[axis] {
        return keep(format!(
            "input depths sum to {depth}, output depth is {}",
            out_desc.shape.dims()[axis]
        ));
    }
    // An in-place consumer of the output would overwrite graph inputs or constants.
    if reads_caller_data && written_in_place(graph, output)? {
        return keep(format!("{output} is overwritten in place"));
    }

    let windows = inputs
        .into_iter()
        .zip(concat::axis_offsets(&descs, axis))
        .map(|(tensor, offset)| {
            let mut origin: Dims = SmallVec::from_elem(0, out_desc.rank());
            origin[axis] = offset;
            (tensor, origin)
        })
        .collect();
    Ok(Decision::Rewrite { output, windows })
}

/// Tensor that owns the storage `tensor` is bound to.
fn storage_root(graph: &Graph, mut tensor: TensorId) -> Result<TensorId> {
    loop {
        match graph.tensor(tensor)?.binding() {
            TensorBinding::Owned => return Ok(tensor),
            TensorBinding::SubTensor { parent, .. } => tensor = *parent,
            TensorBinding::Alias { of } => tensor = *of,
        }
    }
}

/// Whether some node writes over storage shared with `tensor`.
fn written_in_place(graph: &Graph, tensor: TensorId) -> Result<bool> {
    let root = storage_root(graph, tensor)?;
    for entry in graph.tensors() {
        if let TensorBinding::Alias { of } = entry.binding() {
            if storage_root(graph, *of)? == root {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::ops::ActivationFunction;
    use crate::tensor::{DataLayout, DataType, TensorDescriptor};

    fn nchw(channels: usize) -> TensorDescriptor {
        TensorDescriptor::new([1, channels, 2, 2], DataType::F32).with_layout(DataLayout::Nchw)
    }

    #[test]
    fn inputs_become_windows_at_running_depth_offsets() {
        let mut b = GraphBuilder::new("concat");
        let x = b.input(nchw(3)).unwrap();
        let y = b.input(nchw(5)).unwrap();
        let a = b.activation(x, ActivationFunction::Relu).unwrap();
        let c = b.activation(y, ActivationFunction::Relu).unwrap();
        let out = b.depth_concatenate(&[a, c]).unwrap();
        b.output(out).unwrap();
        let mut graph = b.finish();

        let result = DepthConcatSubTensorMutator.mutate(&mut graph).unwrap();
        assert_eq!(result, MutationResult::rewritten(1));
        for (tensor, depth) in [(a, 0), (c, 3)] {
            let TensorBinding::SubTensor { parent, origin } = graph.tensor(tensor).unwrap().binding()
            else {
                panic!("{tensor} should be a sub-tensor");
            };
            assert_eq!(*parent, out);
            assert_eq!(origin.as_slice(), &[0, depth, 0, 0]);
        }
        let concat = graph.nodes_of_type(NodeType::DepthConcatenate)[0];
        assert!(!graph.node(concat).unwrap().is_enabled());
    }

    #[test]
    fn shared_input_keeps_the_copy() {
        let mut b = GraphBuilder::new("shared");
        let x = b.input(nchw(2)).unwrap();
        let a = b.activation(x, ActivationFunction::Tanh).unwrap();
        let out = b.depth_concatenate(&[a, a]).unwrap();
        b.output(out).unwrap();
        let mut graph = b.finish();

        let result = DepthConcatSubTensorMutator.mutate(&mut graph).unwrap();
        assert!(!result.changed);
        assert_eq!(graph.tensor(a).unwrap().binding(), &TensorBinding::Owned);
    }

    #[test]
    fn constants_under_an_in_place_consumer_keep_the_copy() {
        use crate::mutators::InPlaceOperationMutator;
        use crate::tensor::HostTensor;

        let mut b = GraphBuilder::new("const_concat");
        let lhs = b
            .constant(HostTensor::from_vec(nchw(1), vec![1.0f32; 4]).unwrap())
            .unwrap();
        let rhs = b
            .constant(HostTensor::from_vec(nchw(1), vec![2.0f32; 4]).unwrap())
            .unwrap();
        let out = b.depth_concatenate(&[lhs, rhs]).unwrap();
        let squashed = b.activation(out, ActivationFunction::Tanh).unwrap();
        b.output(squashed).unwrap();
        let mut graph = b.finish();

        assert!(InPlaceOperationMutator.mutate(&mut graph).unwrap().changed);
        assert_eq!(
            graph.tensor(squashed).unwrap().binding(),
            &TensorBinding::Alias { of: out }
        );
        let result = DepthConcatSubTensorMutator.mutate(&mut graph).unwrap();
        assert!(!result.changed);
        assert_eq!(graph.tensor(lhs).unwrap().binding(), &TensorBinding::Owned);
        let concat = graph.nodes_of_type(NodeType::DepthConcatenate)[0];
        assert!(graph.node(concat).unwrap().is_enabled());
    }
}
