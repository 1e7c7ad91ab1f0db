use std::collections::BTreeMap;

use crate::error::{GraphError, Result};
use crate::tensor::TensorHandle;

/// Position of a tensor in a kernel's argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorRole {
    Src(usize),
    Weights,
    Bias,
    Dst,
}

/// Role-keyed tensor handles handed opaquely to a kernel at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorPack {
    entries: BTreeMap<TensorRole, TensorHandle>,
}

impl TensorPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, role: TensorRole, handle: TensorHandle) {
        self.entries.insert(role, handle);
    }

    pub fn with(mut self, role: TensorRole, handle: TensorHandle) -> Self {
        self.add(role, handle);
        self
    }

    pub fn get(&self, role: TensorRole) -> Option<&TensorHandle> {
        self.entries.get(&role)
    }

    pub fn require(&self, role: TensorRole) -> Result<&TensorHandle> {
        self.get(role)
            .ok_or_else(|| GraphError::execution(format!("tensor pack is missing {role:?}")))
    }

    /// Source handles `Src(0)..` in order, stopping at the first gap.
    pub fn sources(&self) -> Vec<&TensorHandle> {
        (0..)
            .map_while(|i| self.get(TensorRole::Src(i)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorRole, &TensorHandle)> {
        self.entries.iter()
    }
}
