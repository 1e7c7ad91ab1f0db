use tracing::debug;

use super::{GraphMutator, MutationResult, MutationType};
use crate::error::Result;
use crate::graph::{Graph, NodeId, NodeType, TensorBinding, TensorId};

/// Lets activations and elementwise nodes write over their first input.
///
/// Applies when that input has no other reader, matches the output
/// descriptor and is not caller-visible (graph inputs and constants are
/// never overwritten).
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceOperationMutator;

impl InPlaceOperationMutator {
    const NAME: &'static str = "in_place_operation";
}

impl GraphMutator for InPlaceOperationMutator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Ir
    }

    fn mutate(&self, graph: &mut Graph) -> Result<MutationResult> {
        let mut rewritten = 0;
        for id in graph.topological_order()? {
            let Some((input, output)) = in_place_site(graph, id)? else {
                continue;
            };
            debug!(node = %id, %output, of = %input, "running in place");
            graph.set_binding(output, TensorBinding::Alias { of: input })?;
            rewritten += 1;
        }
        Ok(MutationResult::rewritten(rewritten))
    }
}

fn in_place_site(graph: &Graph, id: NodeId) -> Result<Option<(TensorId, TensorId)>> {
    let node = graph.node(id)?;
    if !node.is_enabled() || !matches!(node.node_type(), NodeType::Activation | NodeType::Elementwise) {
        return Ok(None);
    }
    let (Some(input), Some(output)) = (node.input(0), node.output(0)) else {
        return Ok(None);
    };
    let entry = graph.tensor(input)?;
    if entry.consumers().len() != 1 {
        return Ok(None);
    }
    if !matches!(entry.binding(), TensorBinding::Owned | TensorBinding::Alias { .. }) {
        return Ok(None);
    }
    let Some((producer, _)) = entry.producer() else {
        return Ok(None);
    };
    if matches!(graph.node(producer)?.node_type(), NodeType::Input | NodeType::Const) {
        return Ok(None);
    }
    let out_entry = graph.tensor(output)?;
    if out_entry.binding() != &TensorBinding::Owned
        || out_entry.descriptor().is_none()
        || out_entry.descriptor() != entry.descriptor()
    {
        return Ok(None);
    }
    Ok(Some((input, output)))
}
