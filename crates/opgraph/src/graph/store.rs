use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use super::node::{Node, NodeKind, NodeState, NodeType};
use super::{NodeId, TensorId};
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::kernels::{Capabilities, KernelRegistry};
use crate::mutators::PassManager;
use crate::runtime::ExecutionPlan;
use crate::tensor::{Dims, TensorDescriptor};

/// How a graph tensor obtains storage when the plan is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorBinding {
    /// Gets a buffer of its own.
    Owned,
    /// Window of `parent`'s storage starting at `origin`; owns nothing.
    SubTensor { parent: TensorId, origin: Dims },
    /// Shares the whole storage of `of` (in-place execution).
    Alias { of: TensorId },
}

/// Graph-level tensor: descriptor, producer, consumers and binding.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    id: TensorId,
    desc: Option<TensorDescriptor>,
    producer: Option<(NodeId, usize)>,
    consumers: Vec<(NodeId, usize)>,
    binding: TensorBinding,
}

impl TensorEntry {
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn descriptor(&self) -> Option<&TensorDescriptor> {
        self.desc.as_ref()
    }

    /// Producing node and its output index.
    pub fn producer(&self) -> Option<(NodeId, usize)> {
        self.producer
    }

    /// Consuming `(node, slot)` edges; a node consuming twice appears twice.
    pub fn consumers(&self) -> &[(NodeId, usize)] {
        &self.consumers
    }

    pub fn binding(&self) -> &TensorBinding {
        &self.binding
    }
}

/// Directed acyclic graph of operator nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Option<Node>>,
    tensors: Vec<Option<TensorEntry>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a node with `num_inputs` empty input slots and fresh output tensors.
    pub fn add_node(&mut self, kind: NodeKind, num_inputs: usize) -> Result<NodeId> {
        if !kind.arity().accepts(num_inputs) {
            return Err(GraphError::invalid_argument(format!(
                "{} cannot take {num_inputs} inputs ({:?})",
                kind.node_type(),
                kind.arity()
            )));
        }
        let id = NodeId(self.nodes.len());
        let outputs = (0..kind.num_outputs())
            .map(|index| self.new_tensor(Some((id, index))))
            .collect();
        let state = if num_inputs == 0 {
            NodeState::DescriptorsPending
        } else {
            NodeState::Unconfigured
        };
        trace!(node = %id, kind = %kind.node_type(), "add node");
        self.nodes.push(Some(Node {
            id,
            name: None,
            kind,
            inputs: vec![None; num_inputs],
            outputs,
            enabled: true,
            state,
        }));
        Ok(id)
    }

    pub fn set_node_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.name = Some(name.into());
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::UnknownNode(id))
    }

    /// Live nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorEntry> {
        self.tensors
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::UnknownTensor(id))
    }

    fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorEntry> {
        self.tensors
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::UnknownTensor(id))
    }

    /// Live tensors in id order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorEntry> {
        self.tensors.iter().flatten()
    }

    pub fn descriptor(&self, id: TensorId) -> Option<&TensorDescriptor> {
        self.tensor(id).ok().and_then(TensorEntry::descriptor)
    }

    pub fn consumers(&self, id: TensorId) -> Result<&[(NodeId, usize)]> {
        Ok(self.tensor(id)?.consumers())
    }

    pub fn producer(&self, id: TensorId) -> Result<Option<(NodeId, usize)>> {
        Ok(self.tensor(id)?.producer())
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| node.node_type() == node_type)
            .map(Node::id)
            .collect()
    }

    /// Output tensors of the graph's `Input` nodes, in node order.
    pub fn input_tensors(&self) -> Vec<TensorId> {
        self.nodes()
            .filter(|node| node.node_type() == NodeType::Input)
            .filter_map(|node| node.output(0))
            .collect()
    }

    /// Tensors consumed by the graph's `Output` nodes, in node order.
    pub fn output_tensors(&self) -> Vec<TensorId> {
        self.nodes()
            .filter(|node| node.node_type() == NodeType::Output)
            .filter_map(|node| node.input(0))
            .collect()
    }

    /// Binds `tensor` to input `slot` of `node`, replacing any previous edge.
    pub fn connect(&mut self, tensor: TensorId, node: NodeId, slot: usize) -> Result<()> {
        let slots = self.node(node)?.inputs.len();
        if slot >= slots {
            return Err(GraphError::invalid_argument(format!(
                "{node} has {slots} input slots, cannot bind slot {slot}"
            )));
        }
        if self.node(node)?.inputs[slot] == Some(tensor) {
            return Ok(());
        }
        if let Some((producer, _)) = self.tensor(tensor)?.producer {
            if producer == node || self.reaches(node, producer) {
                return Err(GraphError::Cycle { tensor, node });
            }
        }
        self.disconnect(node, slot)?;
        self.tensor_mut(tensor)?.consumers.push((node, slot));
        let target = self.node_mut(node)?;
        target.inputs[slot] = Some(tensor);
        target.state = if target.inputs.iter().all(Option::is_some) {
            NodeState::DescriptorsPending
        } else {
            NodeState::Unconfigured
        };
        trace!(%tensor, %node, slot, "connect");
        Ok(())
    }

    /// Clears input `slot` of `node`, returning the tensor that was bound.
    pub fn disconnect(&mut self, node: NodeId, slot: usize) -> Result<Option<TensorId>> {
        let target = self.node_mut(node)?;
        let Some(previous) = target.inputs.get_mut(slot).and_then(Option::take) else {
            return Ok(None);
        };
        target.state = NodeState::Unconfigured;
        let entry = self.tensor_mut(previous)?;
        if let Some(pos) = entry.consumers.iter().position(|edge| *edge == (node, slot)) {
            entry.consumers.remove(pos);
        }
        self.drop_if_orphaned(previous);
        Ok(Some(previous))
    }

    /// Removes `node`, detaching its inputs and leaving still-consumed outputs unproduced.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let slots = self.node(id)?.inputs.len();
        for slot in 0..slots {
            self.disconnect(id, slot)?;
        }
        let outputs = self.node(id)?.outputs.clone();
        for tensor in outputs {
            if let Ok(entry) = self.tensor_mut(tensor) {
                entry.producer = None;
            }
            self.drop_if_orphaned(tensor);
        }
        self.nodes[id.0] = None;
        debug!(node = %id, "removed node");
        Ok(())
    }

    /// Makes `tensor` output `index` of `node`; the previous output loses its producer.
    pub fn set_output_tensor(&mut self, node: NodeId, index: usize, tensor: TensorId) -> Result<()> {
        let previous = self.node(node)?.output(index).ok_or_else(|| {
            GraphError::invalid_argument(format!("{node} has no output {index}"))
        })?;
        if previous == tensor {
            return Ok(());
        }
        let entry = self.tensor(tensor)?;
        if entry.producer.is_some() {
            return Err(GraphError::invalid_argument(format!(
                "{tensor} already has a producer"
            )));
        }
        for &(consumer, _) in entry.consumers.clone().iter() {
            if consumer == node || self.reaches(consumer, node) {
                return Err(GraphError::Cycle { tensor, node });
            }
        }
        self.tensor_mut(tensor)?.producer = Some((node, index));
        self.tensor_mut(previous)?.producer = None;
        self.drop_if_orphaned(previous);
        let target = self.node_mut(node)?;
        target.outputs[index] = tensor;
        if target.state == NodeState::DescriptorsResolved {
            target.state = NodeState::DescriptorsPending;
        }
        Ok(())
    }

    /// Replaces the operator of `node`; the slot count must still fit the new kind.
    pub fn replace_kind(&mut self, id: NodeId, kind: NodeKind) -> Result<NodeKind> {
        let node = self.node_mut(id)?;
        if !kind.arity().accepts(node.inputs.len()) || kind.num_outputs() != node.outputs.len() {
            return Err(GraphError::invalid_argument(format!(
                "{} cannot replace {} on {id}",
                kind.node_type(),
                node.node_type()
            )));
        }
        let previous = std::mem::replace(&mut node.kind, kind);
        if node.state == NodeState::DescriptorsResolved {
            node.state = NodeState::DescriptorsPending;
        }
        Ok(previous)
    }

    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> Result<()> {
        self.node_mut(id)?.enabled = enabled;
        Ok(())
    }

    /// Rebinds the storage of `tensor`; binding chains must stay acyclic.
    pub fn set_binding(&mut self, tensor: TensorId, binding: TensorBinding) -> Result<()> {
        self.tensor(tensor)?;
        let target = match &binding {
            TensorBinding::Owned => None,
            TensorBinding::SubTensor { parent, .. } => Some(*parent),
            TensorBinding::Alias { of } => Some(*of),
        };
        let mut cursor = target;
        while let Some(current) = cursor {
            if current == tensor {
                return Err(GraphError::invalid_argument(format!(
                    "binding {tensor} to {binding:?} would make it its own storage"
                )));
            }
            cursor = match self.tensor(current)?.binding() {
                TensorBinding::Owned => None,
                TensorBinding::SubTensor { parent, .. } => Some(*parent),
                TensorBinding::Alias { of } => Some(*of),
            };
        }
        self.tensor_mut(tensor)?.binding = binding;
        Ok(())
    }

    /// Kahn's algorithm; ties are broken by node id so the order is stable.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for node in self.nodes() {
            indegree[node.id.0] = node
                .inputs
                .iter()
                .flatten()
                .filter(|tensor| {
                    self.tensor(**tensor)
                        .map(|entry| entry.producer.is_some())
                        .unwrap_or(false)
                })
                .count();
        }
        let mut ready: BTreeSet<NodeId> = self
            .nodes()
            .filter(|node| indegree[node.id.0] == 0)
            .map(Node::id)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for tensor in &self.node(id)?.outputs {
                for &(consumer, _) in self.tensor(*tensor)?.consumers() {
                    indegree[consumer.0] -= 1;
                    if indegree[consumer.0] == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }
        if order.len() != self.num_nodes() {
            let stuck = self
                .nodes()
                .find(|node| !order.contains(&node.id))
                .ok_or_else(|| GraphError::execution("topological sort lost a node"))?;
            let tensor = stuck.inputs.iter().flatten().next().copied().unwrap_or(TensorId(0));
            return Err(GraphError::Cycle {
                tensor,
                node: stuck.id,
            });
        }
        Ok(order)
    }

    /// Derives and caches the output descriptors of one node.
    pub fn forward_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let inputs = node.bound_inputs().ok_or_else(|| {
            GraphError::shape_mismatch(node.label(), "an input slot is unbound")
        })?;
        let mut descs = Vec::with_capacity(inputs.len());
        for tensor in inputs {
            let desc = self.tensor(tensor)?.desc.clone().ok_or_else(|| {
                GraphError::shape_mismatch(
                    node.label(),
                    format!("input {tensor} has no descriptor"),
                )
            })?;
            descs.push(desc);
        }
        let refs: Vec<&TensorDescriptor> = descs.iter().collect();
        let outputs = (0..node.outputs.len())
            .map(|index| node.configure_output(index, &refs))
            .collect::<Result<Vec<_>>>()?;
        let targets = node.outputs.clone();
        for (tensor, desc) in targets.into_iter().zip(outputs) {
            self.tensor_mut(tensor)?.desc = Some(desc);
        }
        self.node_mut(id)?.state = NodeState::DescriptorsResolved;
        Ok(())
    }

    /// Propagates descriptors through every node in topological order.
    ///
    /// Stops at the first node whose propagation fails.
    pub fn forward_descriptors(&mut self) -> Result<()> {
        for id in self.topological_order()? {
            self.forward_node(id)?;
        }
        Ok(())
    }

    /// Re-propagates descriptors for `start` and everything downstream of it.
    pub fn forward_descriptors_from(&mut self, start: NodeId) -> Result<()> {
        let affected = self.downstream(start)?;
        for id in self.topological_order()? {
            if id == start || affected.contains(&id) {
                self.forward_node(id)?;
            }
        }
        Ok(())
    }

    /// Marks `node`'s descriptors stale; downstream propagation is the caller's job.
    pub fn invalidate(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        node.state = if node.inputs.iter().all(Option::is_some) {
            NodeState::DescriptorsPending
        } else {
            NodeState::Unconfigured
        };
        Ok(())
    }

    /// Runs the configured mutator passes, re-propagates descriptors and
    /// builds an execution plan.
    pub fn finalize(
        &mut self,
        registry: &KernelRegistry,
        caps: &Capabilities,
        config: &GraphConfig,
    ) -> Result<ExecutionPlan> {
        self.forward_descriptors()?;
        let stats = PassManager::from_config(config).run(self)?;
        debug!(graph = %self.name, changed = stats.changed, rewritten = stats.nodes_rewritten, "mutators done");
        self.forward_descriptors()?;
        ExecutionPlan::build(self, registry, caps, config)
    }

    /// Nodes reachable from `start` along producer -> consumer edges (excluding `start`).
    pub fn downstream(&self, start: NodeId) -> Result<BTreeSet<NodeId>> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for tensor in &self.node(id)?.outputs {
                for &(consumer, _) in self.tensor(*tensor)?.consumers() {
                    if seen.insert(consumer) {
                        queue.push_back(consumer);
                    }
                }
            }
        }
        seen.remove(&start);
        Ok(seen)
    }

    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        self.downstream(from)
            .map(|set| set.contains(&to))
            .unwrap_or(false)
    }

    fn new_tensor(&mut self, producer: Option<(NodeId, usize)>) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(Some(TensorEntry {
            id,
            desc: None,
            producer,
            consumers: Vec::new(),
            binding: TensorBinding::Owned,
        }));
        id
    }

    fn drop_if_orphaned(&mut self, id: TensorId) {
        let orphaned = self
            .tensor(id)
            .map(|entry| entry.producer.is_none() && entry.consumers.is_empty())
            .unwrap_or(false);
        let referenced = self.tensors().any(|entry| match entry.binding() {
            TensorBinding::Owned => false,
            TensorBinding::SubTensor { parent, .. } => *parent == id,
            TensorBinding::Alias { of } => *of == id,
        });
        if orphaned && !referenced {
            self.tensors[id.0] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ActivationFunction;
    use crate::tensor::DataType;

    fn input(graph: &mut Graph, dims: &[usize]) -> (NodeId, TensorId) {
        let desc = TensorDescriptor::new(dims, DataType::F32);
        let id = graph.add_node(NodeKind::Input { desc }, 0).unwrap();
        (id, graph.node(id).unwrap().output(0).unwrap())
    }

    #[test]
    fn connect_rejects_cycles() {
        let mut graph = Graph::new("cycle");
        let (_, x) = input(&mut graph, &[4]);
        let a = graph.add_node(NodeKind::Activation(ActivationFunction::Relu), 1).unwrap();
        let b = graph.add_node(NodeKind::Activation(ActivationFunction::Tanh), 1).unwrap();
        graph.connect(x, a, 0).unwrap();
        let a_out = graph.node(a).unwrap().output(0).unwrap();
        graph.connect(a_out, b, 0).unwrap();
        let b_out = graph.node(b).unwrap().output(0).unwrap();
        let err = graph.connect(b_out, a, 0).unwrap_err();
        assert_eq!(err, GraphError::Cycle { tensor: b_out, node: a });
        assert_eq!(graph.node(a).unwrap().input(0), Some(x));
    }

    #[test]
    fn topological_order_is_stable() {
        let mut graph = Graph::new("order");
        let (i0, x) = input(&mut graph, &[2]);
        let (i1, y) = input(&mut graph, &[2]);
        let add = graph
            .add_node(
                NodeKind::Elementwise {
                    op: crate::ops::ElementwiseOp::Add,
                    activation: None,
                },
                2,
            )
            .unwrap();
        graph.connect(y, add, 0).unwrap();
        graph.connect(x, add, 1).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![i0, i1, add]);
    }

    #[test]
    fn node_states_follow_bindings() {
        let mut graph = Graph::new("states");
        let (_, x) = input(&mut graph, &[3]);
        let relu = graph.add_node(NodeKind::Activation(ActivationFunction::Relu), 1).unwrap();
        assert_eq!(graph.node(relu).unwrap().state(), NodeState::Unconfigured);
        graph.connect(x, relu, 0).unwrap();
        assert_eq!(graph.node(relu).unwrap().state(), NodeState::DescriptorsPending);
        graph.forward_descriptors().unwrap();
        assert_eq!(graph.node(relu).unwrap().state(), NodeState::DescriptorsResolved);
        graph.invalidate(relu).unwrap();
        assert_eq!(graph.node(relu).unwrap().state(), NodeState::DescriptorsPending);
        graph.disconnect(relu, 0).unwrap();
        assert_eq!(graph.node(relu).unwrap().state(), NodeState::Unconfigured);
        assert!(matches!(graph.forward_node(relu), Err(GraphError::ShapeMismatch { .. })));
    }

    #[test]
    fn remove_node_drops_unused_tensors() {
        let mut graph = Graph::new("remove");
        let (_, x) = input(&mut graph, &[3]);
        let relu = graph.add_node(NodeKind::Activation(ActivationFunction::Relu), 1).unwrap();
        graph.connect(x, relu, 0).unwrap();
        let out = graph.node(relu).unwrap().output(0).unwrap();
        graph.remove_node(relu).unwrap();
        assert!(graph.tensor(out).is_err());
        assert!(graph.consumers(x).unwrap().is_empty());
        assert!(matches!(graph.node(relu), Err(GraphError::UnknownNode(_))));
    }

    #[test]
    fn binding_chains_cannot_loop() {
        let mut graph = Graph::new("bindings");
        let (_, x) = input(&mut graph, &[3]);
        let (_, y) = input(&mut graph, &[3]);
        graph.set_binding(y, TensorBinding::Alias { of: x }).unwrap();
        assert!(graph.set_binding(x, TensorBinding::Alias { of: y }).is_err());
    }
}
