//! Kernel dispatch: hardware capabilities, the variant registry and the
//! kernel call contract.
//!
//! Kernel bodies live outside this crate; backends register
//! [`KernelVariant`]s whose factories build boxed [`Kernel`]s. The core only
//! evaluates requirements and calls `Kernel::run` with a [`TensorPack`].

mod capability;
mod kernel;
mod pack;
mod registry;

pub use capability::{Capabilities, CpuFeature};
pub use kernel::{Kernel, KernelConfig, KernelContext, KernelFactory, Tiling};
pub use pack::{TensorPack, TensorRole};
pub use registry::{
    KernelRegistry, KernelRequest, KernelVariant, VariantPredicate, VariantRequirements,
};
