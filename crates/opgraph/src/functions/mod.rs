//! Operator functions: one operation instance bound to tensors.
//!
//! A function is validated and configured once (kernel selection, tiling,
//! tensor binding) and then run any number of times.

mod checks;

use std::fmt;

use tracing::trace;

use crate::error::{GraphError, Result};
use crate::kernels::{
    Capabilities, Kernel, KernelContext, KernelRegistry, KernelRequest, TensorPack, TensorRole,
};
use crate::ops::{OpKind, Operation};
use crate::tensor::TensorDescriptor;

/// Pack roles of an operation's inputs, in input order.
pub fn input_roles(op: &Operation, num_inputs: usize) -> Vec<TensorRole> {
    match op {
        Operation::Convolution(_) => [TensorRole::Src(0), TensorRole::Weights, TensorRole::Bias]
            .into_iter()
            .take(num_inputs)
            .collect(),
        _ => (0..num_inputs).map(TensorRole::Src).collect(),
    }
}

/// A configured operator ready to run.
pub struct Function {
    op: OpKind,
    kernel: Box<dyn Kernel>,
    pack: TensorPack,
}

impl Function {
    /// Checks that `op` is well formed for the descriptors and that some
    /// registered kernel accepts it, without binding anything.
    pub fn validate(
        registry: &KernelRegistry,
        caps: &Capabilities,
        op: &Operation,
        inputs: &[TensorDescriptor],
        output: &TensorDescriptor,
    ) -> Result<()> {
        checks::check_operation(op, inputs, output)?;
        registry.validate(&KernelRequest::new(op, inputs, output), caps)
    }

    /// Validates, selects a kernel and binds it to `pack`.
    pub fn configure(
        registry: &KernelRegistry,
        caps: &Capabilities,
        op: Operation,
        inputs: &[TensorDescriptor],
        output: &TensorDescriptor,
        pack: TensorPack,
    ) -> Result<Function> {
        checks::check_operation(&op, inputs, output)?;
        for (role, desc) in input_roles(&op, inputs.len()).into_iter().zip(inputs) {
            expect_bound(&pack, role, desc)?;
        }
        expect_bound(&pack, TensorRole::Dst, output)?;
        let kernel = registry.instantiate(&KernelRequest::new(&op, inputs, output), caps)?;
        Ok(Function {
            op: op.kind(),
            kernel,
            pack,
        })
    }

    pub fn run(&self, cx: &mut KernelContext<'_>) -> Result<()> {
        trace!(kernel = self.kernel.name(), op = ?self.op, "run function");
        self.kernel.run(&self.pack, cx)
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    /// Name of the selected kernel variant's kernel.
    pub fn kernel_name(&self) -> &str {
        self.kernel.name()
    }

    pub fn pack(&self) -> &TensorPack {
        &self.pack
    }
}

fn expect_bound(pack: &TensorPack, role: TensorRole, desc: &TensorDescriptor) -> Result<()> {
    let handle = pack.require(role)?;
    if handle.shape() != &desc.shape {
        return Err(GraphError::shape_mismatch(
            "function",
            format!("{role:?} is bound to a {} window, expected {}", handle.shape(), desc.shape),
        ));
    }
    Ok(())
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("op", &self.op)
            .field("kernel", &self.kernel.name())
            .field("pack", &self.pack)
            .finish()
    }
}
