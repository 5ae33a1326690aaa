//! Task lifecycle and the worker pool that schedules tasks.
//!
//! This module provides:
//! - Pooled, resettable tasks with cooperative cancellation
//! - Dependency gating with strict or relaxed ("run on stop waiting") semantics
//! - A fixed worker pool with an owner-thread completion queue

pub mod scheduler;
pub mod task;

pub use scheduler::{Scheduler, SchedulerError};
pub use task::{
    CancelToken, NeverCancel, RunContext, Task, TaskControl, TaskError, TaskHandle, TaskStatus,
};
