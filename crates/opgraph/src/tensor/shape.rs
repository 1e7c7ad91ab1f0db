//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Inline storage for per-axis values; most tensors have rank <= 4.
pub type Dims = SmallVec<[usize; 4]>;

/// Signed per-axis coordinates (slice starts/ends, strides).
pub type Coordinates = SmallVec<[i64; 4]>;

/// Stores the logical extents of a tensor, outermost axis first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    /// Constructs a new shape from the provided extents.
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        Shape {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Returns a copy with `axis` replaced by `extent`.
    pub fn with_dim(&self, axis: usize, extent: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims[axis] = extent;
        Shape { dims }
    }

    /// Row-major element strides for a dense buffer of this shape.
    pub fn strides(&self) -> Dims {
        contiguous_strides(&self.dims)
    }

    /// Returns `true` when both shapes agree on every axis except `axis`.
    pub fn matches_except(&self, other: &Shape, axis: usize) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.iter().copied())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", parts.join("x"))
    }
}

pub fn contiguous_strides(dims: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(1, dims.len());
    let mut acc = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = acc;
        acc *= dims[axis];
    }
    strides
}

/// Iterates multi-indices of `dims` in row-major order.
pub struct IndexIter {
    dims: Dims,
    current: Dims,
    remaining: usize,
}

impl IndexIter {
    pub fn new(dims: &[usize]) -> Self {
        IndexIter {
            dims: dims.iter().copied().collect(),
            current: SmallVec::from_elem(0, dims.len()),
            remaining: dims.iter().product(),
        }
    }
}

impl Iterator for IndexIter {
    type Item = Dims;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let out = self.current.clone();
        self.remaining -= 1;
        for axis in (0..self.dims.len()).rev() {
            self.current[axis] += 1;
            if self.current[axis] < self.dims[axis] {
                break;
            }
            self.current[axis] = 0;
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
