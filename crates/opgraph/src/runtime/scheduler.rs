use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{GraphError, Result};

/// Fixed-size worker pool that runs kernels over disjoint output chunks.
pub struct CpuScheduler {
    pool: ThreadPool,
    num_threads: usize,
}

impl CpuScheduler {
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("opgraph-cpu-{index}"))
            .build()
            .map_err(|err| GraphError::execution(format!("failed to start worker pool: {err}")))?;
        Ok(CpuScheduler { pool, num_threads })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Calls `f(offset, chunk)` for consecutive `chunk`-sized slices of `out`.
    ///
    /// Chunks never overlap, so kernels write without synchronization. Small
    /// outputs and single-thread pools run inline on the caller.
    pub fn for_each_chunk<T, F>(&self, out: &mut [T], chunk: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        let chunk = chunk.max(1);
        if self.num_threads == 1 || out.len() <= chunk {
            for (index, part) in out.chunks_mut(chunk).enumerate() {
                f(index * chunk, part);
            }
            return;
        }
        self.pool.install(|| {
            out.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(index, part)| f(index * chunk, part));
        });
    }
}

impl std::fmt::Debug for CpuScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuScheduler")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
