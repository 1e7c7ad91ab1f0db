//! Execution plan: storage allocated once, one configured function per node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::queue::DeviceQueue;
use super::scheduler::CpuScheduler;
use crate::config::{ExecutionMode, GraphConfig};
use crate::error::{GraphError, Result};
use crate::functions::{input_roles, Function};
use crate::graph::nodes::{concat, reverse, strided_slice};
use crate::graph::{Graph, Node, NodeKind, TensorBinding, TensorId};
use crate::kernels::{Capabilities, KernelContext, KernelRegistry, TensorPack, TensorRole};
use crate::ops::Operation;
use crate::tensor::{Element, HostTensor, TensorArena, TensorDescriptor, TensorHandle};

/// A finalized graph: buffers, bound functions and the graph's I/O tensors.
pub struct ExecutionPlan {
    arena: Arc<Mutex<TensorArena>>,
    scheduler: Arc<CpuScheduler>,
    steps: Vec<Arc<Function>>,
    handles: HashMap<TensorId, TensorHandle>,
    descriptors: HashMap<TensorId, TensorDescriptor>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    queue: Option<DeviceQueue>,
}

impl ExecutionPlan {
    /// Allocates storage for every tensor and configures every enabled node.
    ///
    /// Descriptors must already be propagated.
    pub fn build(
        graph: &Graph,
        registry: &KernelRegistry,
        caps: &Capabilities,
        config: &GraphConfig,
    ) -> Result<ExecutionPlan> {
        let order = graph.topological_order()?;
        let mut resolver = BindingResolver {
            graph,
            arena: TensorArena::new(),
            handles: HashMap::new(),
        };
        for id in &order {
            let node = graph.node(*id)?;
            for tensor in node.inputs().iter().flatten().chain(node.outputs()) {
                resolver.resolve(*tensor)?;
            }
        }

        let mut steps = Vec::new();
        for id in &order {
            let node = graph.node(*id)?;
            if let NodeKind::Const { tensor } = node.kind() {
                let target = node.output(0).ok_or_else(|| missing_output(node))?;
                let handle = resolver.resolve(target)?;
                resolver.arena.scatter_data(&handle, &tensor.data)?;
                continue;
            }
            if !node.is_enabled() {
                debug!(node = %node.label(), "skipping disabled node");
                continue;
            }
            let Some(step) = configure_node(graph, node, &mut resolver, registry, caps)? else {
                continue;
            };
            debug!(node = %node.label(), kernel = step.kernel_name(), "configured");
            steps.push(Arc::new(step));
        }

        let descriptors = resolver
            .handles
            .keys()
            .filter_map(|id| graph.descriptor(*id).map(|desc| (*id, desc.clone())))
            .collect();
        let scheduler = CpuScheduler::new(config.num_threads.unwrap_or(caps.num_threads()))?;
        let queue = match config.execution_mode {
            ExecutionMode::Immediate => None,
            ExecutionMode::Queued => Some(DeviceQueue::new()?),
        };
        info!(
            graph = graph.name(),
            functions = steps.len(),
            buffers = resolver.arena.live_buffers(),
            threads = scheduler.num_threads(),
            mode = ?config.execution_mode,
            "built execution plan"
        );
        Ok(ExecutionPlan {
            arena: Arc::new(Mutex::new(resolver.arena)),
            scheduler: Arc::new(scheduler),
            steps,
            handles: resolver.handles,
            descriptors,
            inputs: graph.input_tensors(),
            outputs: graph.output_tensors(),
            queue,
        })
    }

    /// Runs every function in topological order.
    ///
    /// In queued mode this only enqueues the work; call [`ExecutionPlan::sync`]
    /// or read an output to wait for it.
    pub fn run(&self) -> Result<()> {
        let Some(queue) = &self.queue else {
            let mut arena = self.arena.lock().expect("tensor arena poisoned");
            let mut cx = KernelContext {
                arena: &mut arena,
                scheduler: &self.scheduler,
            };
            for step in &self.steps {
                step.run(&mut cx)?;
            }
            return Ok(());
        };
        for step in &self.steps {
            let step = Arc::clone(step);
            let arena = Arc::clone(&self.arena);
            let scheduler = Arc::clone(&self.scheduler);
            queue.submit(move || {
                let mut guard = arena.lock().expect("tensor arena poisoned");
                step.run(&mut KernelContext {
                    arena: &mut *guard,
                    scheduler: &scheduler,
                })
            })?;
        }
        Ok(())
    }

    /// Waits for queued work; a no-op in immediate mode.
    pub fn sync(&self) -> Result<()> {
        match &self.queue {
            Some(queue) => queue.finish(),
            None => Ok(()),
        }
    }

    /// Copies `data` into the storage of `tensor`.
    pub fn set_input(&self, tensor: TensorId, data: &HostTensor) -> Result<()> {
        self.sync()?;
        let (handle, desc) = self.binding(tensor)?;
        if data.desc.shape != desc.shape
            || data.desc.data_type.storage_kind() != desc.data_type.storage_kind()
        {
            return Err(GraphError::invalid_argument(format!(
                "{tensor} expects {desc}, got {}",
                data.desc
            )));
        }
        self.arena
            .lock()
            .expect("tensor arena poisoned")
            .scatter_data(handle, &data.data)
    }

    /// Convenience wrapper around [`ExecutionPlan::set_input`] for typed values.
    pub fn write<T: Element>(&self, tensor: TensorId, values: Vec<T>) -> Result<()> {
        let (_, desc) = self.binding(tensor)?;
        self.set_input(tensor, &HostTensor::from_vec(desc.clone(), values)?)
    }

    /// Reads the current contents of `tensor`, waiting for queued work first.
    pub fn output(&self, tensor: TensorId) -> Result<HostTensor> {
        self.sync()?;
        let (handle, desc) = self.binding(tensor)?;
        let data = self
            .arena
            .lock()
            .expect("tensor arena poisoned")
            .gather_data(handle)?;
        HostTensor::new(desc.clone(), data)
    }

    pub fn read<T: Element>(&self, tensor: TensorId) -> Result<Vec<T>> {
        self.sync()?;
        let (handle, _) = self.binding(tensor)?;
        self.arena
            .lock()
            .expect("tensor arena poisoned")
            .gather(handle)
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn handle(&self, tensor: TensorId) -> Option<&TensorHandle> {
        self.handles.get(&tensor)
    }

    pub fn num_functions(&self) -> usize {
        self.steps.len()
    }

    /// Kernel names in execution order.
    pub fn kernel_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.kernel_name()).collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.arena.lock().expect("tensor arena poisoned").live_buffers()
    }

    fn binding(&self, tensor: TensorId) -> Result<(&TensorHandle, &TensorDescriptor)> {
        match (self.handles.get(&tensor), self.descriptors.get(&tensor)) {
            (Some(handle), Some(desc)) => Ok((handle, desc)),
            _ => Err(GraphError::UnknownTensor(tensor)),
        }
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("steps", &self.steps)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("queued", &self.queue.is_some())
            .finish()
    }
}

struct BindingResolver<'g> {
    graph: &'g Graph,
    arena: TensorArena,
    handles: HashMap<TensorId, TensorHandle>,
}

impl BindingResolver<'_> {
    /// Handle for `tensor`, allocating owned storage on first use.
    fn resolve(&mut self, tensor: TensorId) -> Result<TensorHandle> {
        if let Some(handle) = self.handles.get(&tensor) {
            return Ok(handle.clone());
        }
        let entry = self.graph.tensor(tensor)?;
        let desc = entry.descriptor().ok_or_else(|| {
            GraphError::invalid_argument(format!("{tensor} has no descriptor; propagate first"))
        })?;
        let handle = match entry.binding() {
            TensorBinding::Owned => {
                let buffer = self
                    .arena
                    .allocate(&desc.shape, desc.data_type.storage_kind());
                self.arena.handle(buffer)?
            }
            TensorBinding::SubTensor { parent, origin } => {
                self.expect_same_storage(tensor, *parent, desc)?;
                self.resolve(*parent)?.sub_tensor(origin, &desc.shape)?
            }
            TensorBinding::Alias { of } => {
                self.expect_same_storage(tensor, *of, desc)?;
                let target = self.resolve(*of)?;
                if target.shape() == &desc.shape {
                    target
                } else {
                    target.reshaped(&desc.shape)?
                }
            }
        };
        self.handles.insert(tensor, handle.clone());
        Ok(handle)
    }

    fn expect_same_storage(&self, tensor: TensorId, owner: TensorId, desc: &TensorDescriptor) -> Result<()> {
        let owner_desc = self.graph.descriptor(owner).ok_or(GraphError::UnknownTensor(owner))?;
        if owner_desc.data_type.storage_kind() != desc.data_type.storage_kind() {
            return Err(GraphError::invalid_argument(format!(
                "{tensor} ({desc}) cannot share storage with {owner} ({owner_desc})"
            )));
        }
        Ok(())
    }
}

fn missing_output(node: &Node) -> GraphError {
    GraphError::invalid_argument(format!("{} has no output tensor", node.label()))
}

/// Lowers `node` to an operation and configures its function; `None` for
/// nodes that execute nothing.
fn configure_node(
    graph: &Graph,
    node: &Node,
    resolver: &mut BindingResolver<'_>,
    registry: &KernelRegistry,
    caps: &Capabilities,
) -> Result<Option<Function>> {
    if matches!(
        node.kind(),
        NodeKind::Input { .. } | NodeKind::Const { .. } | NodeKind::Output
    ) {
        return Ok(None);
    }
    let inputs = node.bound_inputs().ok_or_else(|| {
        GraphError::shape_mismatch(node.label(), "an input slot is unbound")
    })?;
    let output = node.output(0).ok_or_else(|| missing_output(node))?;
    let input_descs = inputs
        .iter()
        .map(|id| {
            graph
                .descriptor(*id)
                .cloned()
                .ok_or(GraphError::UnknownTensor(*id))
        })
        .collect::<Result<Vec<_>>>()?;
    let output_desc = graph
        .descriptor(output)
        .cloned()
        .ok_or(GraphError::UnknownTensor(output))?;

    let op = match node.kind() {
        NodeKind::Input { .. } | NodeKind::Const { .. } | NodeKind::Output => return Ok(None),
        NodeKind::Flatten => Operation::Copy,
        NodeKind::StridedSlice(params) => Operation::StridedSlice {
            axes: strided_slice::resolve_strided_slice(&input_descs[0].shape, params)?,
        },
        NodeKind::DepthConcatenate => {
            let refs: Vec<&TensorDescriptor> = input_descs.iter().collect();
            Operation::Concatenate {
                axis: concat::depth_axis(&refs)?,
            }
        }
        NodeKind::Activation(function) => Operation::Activation(*function),
        NodeKind::Elementwise { op, activation } => Operation::Elementwise {
            op: *op,
            activation: *activation,
        },
        NodeKind::MatMul { activation } => Operation::MatMul {
            activation: *activation,
        },
        NodeKind::Convolution(info) => Operation::Convolution(*info),
        NodeKind::Reverse {
            axes,
            use_inverted_axis,
        } => Operation::Reverse {
            axes: reverse::resolve_axes(input_descs[0].rank(), axes, *use_inverted_axis)?,
        },
        NodeKind::Dequantize { .. } => Operation::Dequantize,
    };

    let mut pack = TensorPack::new();
    for (role, tensor) in input_roles(&op, inputs.len()).into_iter().zip(&inputs) {
        pack.add(role, resolver.resolve(*tensor)?);
    }
    pack.add(TensorRole::Dst, resolver.resolve(output)?);
    Function::configure(registry, caps, op, &input_descs, &output_desc, pack)
        .map(Some)
        .map_err(|err| err.at_node(node.label()))
}
