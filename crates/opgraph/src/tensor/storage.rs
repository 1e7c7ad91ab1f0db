//! Host storage arena and sub-tensor handles.
//!
//! Buffers live in a [`TensorArena`] and are addressed through generation
//! checked [`BufferId`]s. A [`TensorHandle`] names a rectangular window of a
//! buffer: whole tensors use the full extent, sub-tensors a smaller window at
//! some origin. Handles never own memory; releasing a buffer bumps its
//! generation so every outstanding handle into it fails with `StaleHandle`.

use half::f16;
use smallvec::SmallVec;

use super::descriptor::TensorDescriptor;
use super::dtype::StorageKind;
use super::shape::{contiguous_strides, Dims, IndexIter, Shape};
use crate::error::{GraphError, Result};

/// Dense host data for one buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F16(Vec<f16>),
    F32(Vec<f32>),
}

macro_rules! dispatch_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::U8($v) => $body,
            TensorData::I8($v) => $body,
            TensorData::U16($v) => $body,
            TensorData::I16($v) => $body,
            TensorData::U32($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::F16($v) => $body,
            TensorData::F32($v) => $body,
        }
    };
}

impl TensorData {
    pub fn zeroed(kind: StorageKind, len: usize) -> Self {
        match kind {
            StorageKind::U8 => TensorData::U8(vec![0; len]),
            StorageKind::I8 => TensorData::I8(vec![0; len]),
            StorageKind::U16 => TensorData::U16(vec![0; len]),
            StorageKind::I16 => TensorData::I16(vec![0; len]),
            StorageKind::U32 => TensorData::U32(vec![0; len]),
            StorageKind::I32 => TensorData::I32(vec![0; len]),
            StorageKind::F16 => TensorData::F16(vec![f16::ZERO; len]),
            StorageKind::F32 => TensorData::F32(vec![0.0; len]),
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            TensorData::U8(_) => StorageKind::U8,
            TensorData::I8(_) => StorageKind::I8,
            TensorData::U16(_) => StorageKind::U16,
            TensorData::I16(_) => StorageKind::I16,
            TensorData::U32(_) => StorageKind::U32,
            TensorData::I32(_) => StorageKind::I32,
            TensorData::F16(_) => StorageKind::F16,
            TensorData::F32(_) => StorageKind::F32,
        }
    }

    pub fn len(&self) -> usize {
        dispatch_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widens every element to `f32` (used by float kernels and dequantization).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        dispatch_data!(self, v => v.iter().map(|x| Element::to_f32(*x)).collect())
    }
}

/// Scalar types that can live in a [`TensorData`] buffer.
pub trait Element: Copy + Default + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    const KIND: StorageKind;

    fn slice(data: &TensorData) -> Option<&[Self]>;
    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]>;
    fn wrap(values: Vec<Self>) -> TensorData;
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $kind:ident, |$x:ident| $to:expr, |$y:ident| $from:expr) => {
        impl Element for $ty {
            const KIND: StorageKind = StorageKind::$kind;

            fn slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn to_f32(self) -> f32 {
                let $x = self;
                $to
            }

            fn from_f32(value: f32) -> Self {
                let $y = value;
                $from
            }
        }
    };
}

impl_element!(u8, U8, U8, |x| x as f32, |y| y.round().clamp(0.0, u8::MAX as f32) as u8);
impl_element!(i8, I8, I8, |x| x as f32, |y| y.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8);
impl_element!(u16, U16, U16, |x| x as f32, |y| y.round().clamp(0.0, u16::MAX as f32) as u16);
impl_element!(i16, I16, I16, |x| x as f32, |y| y
    .round()
    .clamp(i16::MIN as f32, i16::MAX as f32) as i16);
impl_element!(u32, U32, U32, |x| x as f32, |y| y.round().max(0.0) as u32);
impl_element!(i32, I32, I32, |x| x as f32, |y| y.round() as i32);
impl_element!(f16, F16, F16, |x| x.to_f32(), |y| f16::from_f32(y));
impl_element!(f32, F32, F32, |x| x, |y| y);

/// A descriptor paired with dense host data; used for graph inputs, constants and outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub desc: TensorDescriptor,
    pub data: TensorData,
}

impl HostTensor {
    pub fn new(desc: TensorDescriptor, data: TensorData) -> Result<Self> {
        if data.kind() != desc.data_type.storage_kind() {
            return Err(GraphError::invalid_argument(format!(
                "{:?} data cannot back a {:?} tensor",
                data.kind(),
                desc.data_type
            )));
        }
        if data.len() != desc.num_elements() {
            return Err(GraphError::invalid_argument(format!(
                "tensor {} expects {} elements, got {}",
                desc.shape,
                desc.num_elements(),
                data.len()
            )));
        }
        Ok(Self { desc, data })
    }

    pub fn from_vec<T: Element>(desc: TensorDescriptor, values: Vec<T>) -> Result<Self> {
        Self::new(desc, T::wrap(values))
    }

    pub fn zeroed(desc: TensorDescriptor) -> Self {
        let data = TensorData::zeroed(desc.data_type.storage_kind(), desc.num_elements());
        Self { desc, data }
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }
}

/// Generation-checked reference to an arena buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    index: usize,
    generation: u32,
}

impl BufferId {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Rectangular window `[origin, origin + shape)` into an arena buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHandle {
    buffer: BufferId,
    origin: Dims,
    shape: Shape,
    buffer_shape: Shape,
}

impl TensorHandle {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn origin(&self) -> &[usize] {
        &self.origin
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn buffer_shape(&self) -> &Shape {
        &self.buffer_shape
    }

    /// Returns `true` when the window covers the whole buffer.
    pub fn is_whole(&self) -> bool {
        self.shape == self.buffer_shape
    }

    /// Window of this window; `origin` is relative to this handle.
    pub fn sub_tensor(&self, origin: &[usize], shape: &Shape) -> Result<TensorHandle> {
        if origin.len() != self.shape.rank() || shape.rank() != self.shape.rank() {
            return Err(GraphError::invalid_argument(format!(
                "sub-tensor rank {} / origin rank {} do not match parent rank {}",
                shape.rank(),
                origin.len(),
                self.shape.rank()
            )));
        }
        for axis in 0..origin.len() {
            if origin[axis] + shape.dims()[axis] > self.shape.dims()[axis] {
                return Err(GraphError::invalid_argument(format!(
                    "sub-tensor {} at {:?} exceeds parent {} on axis {axis}",
                    shape,
                    origin,
                    self.shape
                )));
            }
        }
        let origin = self
            .origin
            .iter()
            .zip(origin.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok(TensorHandle {
            buffer: self.buffer,
            origin,
            shape: shape.clone(),
            buffer_shape: self.buffer_shape.clone(),
        })
    }

    /// Reinterprets a whole-buffer handle with a different shape of equal size.
    pub fn reshaped(&self, shape: &Shape) -> Result<TensorHandle> {
        if !self.is_whole() || shape.num_elements() != self.shape.num_elements() {
            return Err(GraphError::invalid_argument(format!(
                "cannot view {} window of {} as {}",
                self.shape, self.buffer_shape, shape
            )));
        }
        Ok(TensorHandle {
            buffer: self.buffer,
            origin: SmallVec::from_elem(0, shape.rank()),
            shape: shape.clone(),
            buffer_shape: shape.clone(),
        })
    }

    /// Visits contiguous runs of the window as `(buffer offset, run length)`.
    fn for_each_run(&self, mut f: impl FnMut(usize, usize)) {
        let rank = self.shape.rank();
        if self.shape.num_elements() == 0 {
            return;
        }
        if rank == 0 {
            f(0, 1);
            return;
        }
        let strides = contiguous_strides(self.buffer_shape.dims());
        let run = self.shape.dims()[rank - 1];
        for outer in IndexIter::new(&self.shape.dims()[..rank - 1]) {
            let mut offset = self.origin[rank - 1];
            for axis in 0..rank - 1 {
                offset += (self.origin[axis] + outer[axis]) * strides[axis];
            }
            f(offset, run);
        }
    }
}

struct Slot {
    generation: u32,
    buffer: Option<Buffer>,
}

struct Buffer {
    shape: Shape,
    data: TensorData,
}

/// Owner of every buffer allocated for an execution plan.
#[derive(Default)]
pub struct TensorArena {
    slots: Vec<Slot>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zeroed buffer, reusing a released slot when one exists.
    pub fn allocate(&mut self, shape: &Shape, kind: StorageKind) -> BufferId {
        let buffer = Buffer {
            shape: shape.clone(),
            data: TensorData::zeroed(kind, shape.num_elements()),
        };
        if let Some(index) = self.slots.iter().position(|slot| slot.buffer.is_none()) {
            let slot = &mut self.slots[index];
            slot.buffer = Some(buffer);
            return BufferId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            buffer: Some(buffer),
        });
        BufferId {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    /// Frees a buffer; every handle into it becomes stale.
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        self.buffer(id)?;
        let slot = &mut self.slots[id.index];
        slot.buffer = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    pub fn live_buffers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.buffer.is_some()).count()
    }

    /// Handle covering the whole buffer.
    pub fn handle(&self, id: BufferId) -> Result<TensorHandle> {
        let buffer = self.buffer(id)?;
        Ok(TensorHandle {
            buffer: id,
            origin: SmallVec::from_elem(0, buffer.shape.rank()),
            shape: buffer.shape.clone(),
            buffer_shape: buffer.shape.clone(),
        })
    }

    pub fn data(&self, id: BufferId) -> Result<&TensorData> {
        Ok(&self.buffer(id)?.data)
    }

    /// Copies the window out into a dense row-major vector.
    pub fn gather<T: Element>(&self, handle: &TensorHandle) -> Result<Vec<T>> {
        let data = self.typed_slice::<T>(handle)?;
        let mut out = Vec::with_capacity(handle.shape.num_elements());
        handle.for_each_run(|offset, len| out.extend_from_slice(&data[offset..offset + len]));
        Ok(out)
    }

    /// Writes dense row-major `values` into the window.
    pub fn scatter<T: Element>(&mut self, handle: &TensorHandle, values: &[T]) -> Result<()> {
        if values.len() != handle.shape.num_elements() {
            return Err(GraphError::execution(format!(
                "scatter of {} elements into window {}",
                values.len(),
                handle.shape
            )));
        }
        let buffer = self.buffer_mut(handle.buffer)?;
        let data = T::slice_mut(&mut buffer.data).ok_or_else(|| {
            GraphError::execution(format!("buffer does not hold {:?} elements", T::KIND))
        })?;
        let mut cursor = 0usize;
        handle.for_each_run(|offset, len| {
            data[offset..offset + len].copy_from_slice(&values[cursor..cursor + len]);
            cursor += len;
        });
        Ok(())
    }

    /// Type-erased gather used by data-movement kernels.
    pub fn gather_data(&self, handle: &TensorHandle) -> Result<TensorData> {
        let kind = self.buffer(handle.buffer)?.data.kind();
        Ok(match kind {
            StorageKind::U8 => TensorData::U8(self.gather(handle)?),
            StorageKind::I8 => TensorData::I8(self.gather(handle)?),
            StorageKind::U16 => TensorData::U16(self.gather(handle)?),
            StorageKind::I16 => TensorData::I16(self.gather(handle)?),
            StorageKind::U32 => TensorData::U32(self.gather(handle)?),
            StorageKind::I32 => TensorData::I32(self.gather(handle)?),
            StorageKind::F16 => TensorData::F16(self.gather(handle)?),
            StorageKind::F32 => TensorData::F32(self.gather(handle)?),
        })
    }

    pub fn scatter_data(&mut self, handle: &TensorHandle, values: &TensorData) -> Result<()> {
        dispatch_data!(values, v => self.scatter(handle, v.as_slice()))
    }

    fn typed_slice<T: Element>(&self, handle: &TensorHandle) -> Result<&[T]> {
        let buffer = self.buffer(handle.buffer)?;
        T::slice(&buffer.data).ok_or_else(|| {
            GraphError::execution(format!(
                "buffer holds {:?} elements, kernel expected {:?}",
                buffer.data.kind(),
                T::KIND
            ))
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.buffer.as_ref())
            .ok_or(GraphError::StaleHandle {
                index: id.index,
                generation: id.generation,
            })
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Buffer> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.buffer.as_mut())
            .ok_or(GraphError::StaleHandle {
                index: id.index,
                generation: id.generation,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(arena: &mut TensorArena, dims: [usize; 2]) -> TensorHandle {
        let shape = Shape::from(dims);
        let id = arena.allocate(&shape, StorageKind::F32);
        let handle = arena.handle(id).unwrap();
        let values: Vec<f32> = (0..shape.num_elements()).map(|v| v as f32).collect();
        arena.scatter(&handle, &values).unwrap();
        handle
    }

    #[test]
    fn sub_tensor_gathers_its_window() {
        let mut arena = TensorArena::new();
        let whole = filled(&mut arena, [3, 4]);
        let window = whole.sub_tensor(&[1, 1], &Shape::from([2, 2])).unwrap();
        assert_eq!(arena.gather::<f32>(&window).unwrap(), vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn nested_windows_compose_origins() {
        let mut arena = TensorArena::new();
        let whole = filled(&mut arena, [4, 4]);
        let outer = whole.sub_tensor(&[1, 0], &Shape::from([3, 4])).unwrap();
        let inner = outer.sub_tensor(&[1, 2], &Shape::from([1, 2])).unwrap();
        assert_eq!(inner.origin(), &[2, 2]);
        assert_eq!(arena.gather::<f32>(&inner).unwrap(), vec![10.0, 11.0]);
    }

    #[test]
    fn window_outside_parent_is_rejected() {
        let mut arena = TensorArena::new();
        let whole = filled(&mut arena, [2, 2]);
        let err = whole.sub_tensor(&[1, 1], &Shape::from([2, 1])).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn scatter_into_window_only_touches_window() {
        let mut arena = TensorArena::new();
        let whole = filled(&mut arena, [2, 3]);
        let column = whole.sub_tensor(&[0, 2], &Shape::from([2, 1])).unwrap();
        arena.scatter(&column, &[-1.0f32, -2.0]).unwrap();
        assert_eq!(
            arena.gather::<f32>(&whole).unwrap(),
            vec![0.0, 1.0, -1.0, 3.0, 4.0, -2.0]
        );
    }

    #[test]
    fn released_buffer_invalidates_handles() {
        let mut arena = TensorArena::new();
        let handle = filled(&mut arena, [2, 2]);
        arena.release(handle.buffer()).unwrap();
        assert!(matches!(
            arena.gather::<f32>(&handle),
            Err(GraphError::StaleHandle { .. })
        ));
        let reused = arena.allocate(&Shape::from([2, 2]), StorageKind::F32);
        assert_eq!(reused.index(), handle.buffer().index());
        assert!(arena.gather::<f32>(&handle).is_err());
    }

    #[test]
    fn rank_one_window_round_trips() {
        let mut arena = TensorArena::new();
        let id = arena.allocate(&Shape::from([5]), StorageKind::I32);
        let whole = arena.handle(id).unwrap();
        let tail = whole.sub_tensor(&[3], &Shape::from([2])).unwrap();
        arena.scatter(&tail, &[7i32, 8]).unwrap();
        assert_eq!(arena.gather::<i32>(&whole).unwrap(), vec![0, 0, 0, 7, 8]);
    }
}
