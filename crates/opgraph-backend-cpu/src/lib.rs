//! Portable CPU kernels for `opgraph`.
//!
//! [`register_cpu_kernels`] adds every kernel variant of this crate to a
//! registry. Variants that declare CPU features are only selected when the
//! capabilities passed to `finalize` report them.

mod kernels;

use opgraph::kernels::KernelRegistry;

/// Adds this crate's kernel variants to `registry`.
pub fn register_cpu_kernels(registry: &mut KernelRegistry) {
    kernels::register_all(registry);
}

/// A fresh registry holding only the CPU kernels.
pub fn cpu_registry() -> KernelRegistry {
    let mut registry = KernelRegistry::new();
    register_cpu_kernels(&mut registry);
    registry
}
