//! Per-variant descriptor propagation rules.
//!
//! Each helper is pure: it derives output descriptors from input descriptors
//! and parameters. Graph nodes call them during propagation and operator
//! functions reuse them to validate bound tensors.

pub mod arithmetic;
pub mod concat;
pub mod convolution;
pub mod dequantize;
pub mod flatten;
pub mod reverse;
pub mod strided_slice;

pub use convolution::ConvGeometry;
pub use strided_slice::StridedSliceParams;
