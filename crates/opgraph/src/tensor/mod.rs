//! Tensor descriptors, element types and host storage.

pub mod descriptor;
pub mod dtype;
pub mod shape;
pub mod storage;

pub use descriptor::TensorDescriptor;
pub use dtype::{DataLayout, DataType, LayoutDimension, QuantizationInfo, StorageKind};
pub use shape::{Coordinates, Dims, Shape};
pub use storage::{BufferId, Element, HostTensor, TensorArena, TensorData, TensorHandle};
