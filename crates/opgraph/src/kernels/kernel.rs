use std::sync::Arc;

use super::capability::{Capabilities, CpuFeature};
use super::pack::TensorPack;
use super::registry::KernelRequest;
use crate::error::Result;
use crate::ops::Operation;
use crate::runtime::CpuScheduler;
use crate::tensor::{TensorArena, TensorDescriptor};

const MIN_CHUNK: usize = 256;

/// Everything a kernel may touch while running.
pub struct KernelContext<'a> {
    pub arena: &'a mut TensorArena,
    pub scheduler: &'a CpuScheduler,
}

/// A configured kernel bound to one operation instance.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, pack: &TensorPack, cx: &mut KernelContext<'_>) -> Result<()>;
}

/// Blocking parameters derived from the problem shape at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiling {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
    /// Output elements per parallel work item.
    pub chunk: usize,
}

impl Tiling {
    pub fn for_request(request: &KernelRequest<'_>, caps: &Capabilities) -> Tiling {
        let base = if caps.has(CpuFeature::Avx512f) || caps.has(CpuFeature::Sve) {
            64
        } else if caps.has(CpuFeature::Avx2) || caps.has(CpuFeature::Neon) {
            32
        } else {
            16
        };
        let (m, n, k) = match (request.inputs.first(), request.inputs.get(1)) {
            (Some(lhs), Some(rhs)) if lhs.rank() == 2 && rhs.rank() == 2 => {
                (lhs.shape.dims()[0], rhs.shape.dims()[1], lhs.shape.dims()[1])
            }
            _ => (1, 1, 1),
        };
        let total = request.output.num_elements().max(1);
        let workers = caps.num_threads().max(1) * 4;
        Tiling {
            block_m: base.min(m.max(1)),
            block_n: base.min(n.max(1)),
            block_k: (base * 4).min(k.max(1)),
            chunk: total.div_ceil(workers).max(MIN_CHUNK).min(total),
        }
    }
}

/// Fully resolved arguments handed to a [`KernelFactory`].
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    pub operation: Operation,
    pub inputs: Vec<TensorDescriptor>,
    pub output: TensorDescriptor,
    pub tiling: Tiling,
}

/// Builds a kernel for one configuration.
pub type KernelFactory = Arc<dyn Fn(&KernelConfig) -> Result<Box<dyn Kernel>> + Send + Sync>;
