use tracing::debug;

use super::{GraphMutator, MutationResult, MutationType};
use crate::error::Result;
use crate::graph::{Graph, NodeId, NodeKind, NodeType, TensorBinding, TensorId};

/// Folds an activation into the convolution, matmul or elementwise node
/// that feeds it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeFusionMutator;

impl NodeFusionMutator {
    const NAME: &'static str = "node_fusion";
}

struct Site {
    activation: NodeId,
    producer: NodeId,
    output: TensorId,
    fused: NodeKind,
}

impl GraphMutator for NodeFusionMutator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Ir
    }

    fn mutate(&self, graph: &mut Graph) -> Result<MutationResult> {
        let mut rewritten = 0;
        for id in graph.topological_order()? {
            let Some(site) = fusion_site(graph, id)? else {
                continue;
            };
            debug!(producer = %site.producer, activation = %site.activation, "fusing activation");
            graph.replace_kind(site.producer, site.fused)?;
            graph.remove_node(site.activation)?;
            graph.set_output_tensor(site.producer, 0, site.output)?;
            graph.forward_descriptors_from(site.producer)?;
            rewritten += 1;
        }
        Ok(MutationResult::rewritten(rewritten))
    }
}

fn fusion_site(graph: &Graph, id: NodeId) -> Result<Option<Site>> {
    // Earlier fusions remove nodes from the precomputed order.
    let Ok(node) = graph.node(id) else {
        return Ok(None);
    };
    let NodeKind::Activation(function) = node.kind() else {
        return Ok(None);
    };
    if !node.is_enabled() {
        return Ok(None);
    }
    let (Some(input), Some(output)) = (node.input(0), node.output(0)) else {
        return Ok(None);
    };
    let out_entry = graph.tensor(output)?;
    if out_entry.consumers().is_empty() || out_entry.binding() != &TensorBinding::Owned {
        return Ok(None);
    }
    let entry = graph.tensor(input)?;
    let Some((producer_id, 0)) = entry.producer() else {
        return Ok(None);
    };
    if entry.consumers().len() != 1 || entry.binding() != &TensorBinding::Owned {
        debug!(node = %node.label(), "activation input is shared; not fused");
        return Ok(None);
    }
    let producer = graph.node(producer_id)?;
    let fusable = matches!(
        producer.node_type(),
        NodeType::Convolution | NodeType::MatMul | NodeType::Elementwise
    );
    if !producer.is_enabled() || !fusable || producer.kind().fused_activation().is_some() {
        return Ok(None);
    }
    let mut fused = producer.kind().clone();
    if !fused.fuse_activation(*function) {
        return Ok(None);
    }
    Ok(Some(Site {
        activation: id,
        producer: producer_id,
        output,
        fused,
    }))
}
