//! Kernel variant registry and selection.
//!
//! Variants are registered per [`OpKind`] with a set of requirements. Selection
//! keeps the variants whose requirements hold for the request and the host
//! capabilities, then ranks them by
//!
//! 1. the highest tier among their required CPU features,
//! 2. the number of required features,
//! 3. the number of declared constraints,
//! 4. registration order (earlier wins).
//!
//! The ranking is total, so the same request always picks the same variant.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::capability::{Capabilities, CpuFeature};
use super::kernel::{Kernel, KernelConfig, KernelFactory, Tiling};
use crate::error::{GraphError, Result};
use crate::ops::{OpKind, Operation};
use crate::tensor::{DataLayout, DataType, TensorDescriptor};

/// What a caller wants to run: an operation over described tensors.
#[derive(Debug, Clone, Copy)]
pub struct KernelRequest<'a> {
    pub operation: &'a Operation,
    pub inputs: &'a [TensorDescriptor],
    pub output: &'a TensorDescriptor,
}

impl<'a> KernelRequest<'a> {
    pub fn new(
        operation: &'a Operation,
        inputs: &'a [TensorDescriptor],
        output: &'a TensorDescriptor,
    ) -> Self {
        KernelRequest {
            operation,
            inputs,
            output,
        }
    }

    pub fn op(&self) -> OpKind {
        self.operation.kind()
    }

    /// Element type that drives selection: the first input's, else the output's.
    pub fn data_type(&self) -> DataType {
        self.inputs
            .first()
            .map_or(self.output.data_type, |desc| desc.data_type)
    }

    pub fn layout(&self) -> DataLayout {
        self.inputs.first().map_or(self.output.layout, |desc| desc.layout)
    }

    /// Extent of the first input's depth axis, when it has one.
    pub fn channels(&self) -> Option<usize> {
        let desc = self.inputs.first().unwrap_or(self.output);
        desc.depth_axis().and_then(|axis| desc.shape.dim(axis))
    }
}

pub type VariantPredicate = Arc<dyn Fn(&KernelRequest<'_>) -> bool + Send + Sync>;

/// Conditions a request must meet for a variant to be eligible.
///
/// Empty lists mean "any".
#[derive(Clone, Default)]
pub struct VariantRequirements {
    pub data_types: Vec<DataType>,
    pub layouts: Vec<DataLayout>,
    pub features: Vec<CpuFeature>,
    pub min_channels: Option<usize>,
    pub predicate: Option<VariantPredicate>,
}

impl VariantRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_types(mut self, types: impl IntoIterator<Item = DataType>) -> Self {
        self.data_types.extend(types);
        self
    }

    pub fn layouts(mut self, layouts: impl IntoIterator<Item = DataLayout>) -> Self {
        self.layouts.extend(layouts);
        self
    }

    pub fn feature(mut self, feature: CpuFeature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn min_channels(mut self, channels: usize) -> Self {
        self.min_channels = Some(channels);
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&KernelRequest<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// `Err` carries the first reason the request is rejected.
    fn check(&self, request: &KernelRequest<'_>, caps: &Capabilities) -> std::result::Result<(), String> {
        if let Some(missing) = self.features.iter().find(|feature| !caps.has(**feature)) {
            return Err(format!("requires {missing}"));
        }
        let data_type = request.data_type();
        if !self.data_types.is_empty() && !self.data_types.contains(&data_type) {
            return Err(format!("does not take {data_type:?}"));
        }
        let layout = request.layout();
        if !self.layouts.is_empty() && !self.layouts.contains(&layout) {
            return Err(format!("does not take {layout:?} layout"));
        }
        if let Some(min) = self.min_channels {
            match request.channels() {
                Some(channels) if channels >= min => {}
                other => return Err(format!("needs at least {min} channels, got {other:?}")),
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(request) {
                return Err("shape predicate rejected the request".to_string());
            }
        }
        Ok(())
    }

    fn max_tier(&self) -> u8 {
        self.features.iter().map(|f| f.tier()).max().unwrap_or(0)
    }

    fn constraint_count(&self) -> usize {
        usize::from(!self.data_types.is_empty())
            + usize::from(!self.layouts.is_empty())
            + usize::from(self.min_channels.is_some())
            + usize::from(self.predicate.is_some())
    }
}

impl fmt::Debug for VariantRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantRequirements")
            .field("data_types", &self.data_types)
            .field("layouts", &self.layouts)
            .field("features", &self.features)
            .field("min_channels", &self.min_channels)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// One registered implementation of an operation.
pub struct KernelVariant {
    name: String,
    op: OpKind,
    requirements: VariantRequirements,
    factory: KernelFactory,
}

impl KernelVariant {
    pub fn new<F>(name: impl Into<String>, op: OpKind, requirements: VariantRequirements, factory: F) -> Self
    where
        F: Fn(&KernelConfig) -> Result<Box<dyn Kernel>> + Send + Sync + 'static,
    {
        KernelVariant {
            name: name.into(),
            op,
            requirements,
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn requirements(&self) -> &VariantRequirements {
        &self.requirements
    }

    fn rank(&self, index: usize) -> (u8, usize, usize, Reverse<usize>) {
        (
            self.requirements.max_tier(),
            self.requirements.features.len(),
            self.requirements.constraint_count(),
            Reverse(index),
        )
    }
}

impl fmt::Debug for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelVariant")
            .field("name", &self.name)
            .field("op", &self.op)
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// Explicitly constructed table of kernel variants.
#[derive(Default)]
pub struct KernelRegistry {
    variants: Vec<KernelVariant>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, variant: KernelVariant) -> &mut Self {
        debug!(variant = variant.name(), op = ?variant.op(), "register kernel variant");
        self.variants.push(variant);
        self
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Registered variants for `op`, in registration order.
    pub fn variants(&self, op: OpKind) -> impl Iterator<Item = &KernelVariant> {
        self.variants.iter().filter(move |variant| variant.op == op)
    }

    /// Picks the best eligible variant for `request`.
    pub fn select(&self, request: &KernelRequest<'_>, caps: &Capabilities) -> Result<&KernelVariant> {
        let op = request.op();
        let mut rejections = Vec::new();
        let mut best: Option<(usize, &KernelVariant)> = None;
        for (index, variant) in self.variants.iter().enumerate() {
            if variant.op != op {
                continue;
            }
            match variant.requirements.check(request, caps) {
                Ok(()) => {
                    let better = best.map_or(true, |(best_index, current)| {
                        variant.rank(index) > current.rank(best_index)
                    });
                    if better {
                        best = Some((index, variant));
                    }
                }
                Err(reason) => rejections.push(format!("{}: {reason}", variant.name)),
            }
        }
        match best {
            Some((_, variant)) => {
                debug!(op = ?op, variant = variant.name(), data_type = ?request.data_type(), "selected kernel");
                Ok(variant)
            }
            None if rejections.is_empty() => Err(GraphError::unsupported(
                op,
                "no kernel variant registered",
            )),
            None => Err(GraphError::unsupported(op, rejections.join("; "))),
        }
    }

    /// Dry run of [`KernelRegistry::select`].
    pub fn validate(&self, request: &KernelRequest<'_>, caps: &Capabilities) -> Result<()> {
        self.select(request, caps).map(|_| ())
    }

    /// Selects a variant and builds its kernel with shape-derived tiling.
    pub fn instantiate(&self, request: &KernelRequest<'_>, caps: &Capabilities) -> Result<Box<dyn Kernel>> {
        let variant = self.select(request, caps)?;
        let config = KernelConfig {
            operation: request.operation.clone(),
            inputs: request.inputs.to_vec(),
            output: request.output.clone(),
            tiling: Tiling::for_request(request, caps),
        };
        (variant.factory)(&config)
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.variants.iter().map(|variant| variant.name()))
            .finish()
    }
}
