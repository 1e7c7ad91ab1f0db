//! Execution: worker pool, device queue and the finalized execution plan.

mod plan;
mod queue;
mod scheduler;

pub use plan::ExecutionPlan;
pub use queue::DeviceQueue;
pub use scheduler::CpuScheduler;
