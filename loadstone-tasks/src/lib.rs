//! Job system: tasks are bundled into groups, groups are queued into priority tiers and drained
//! by pools of worker threads. Threads that block on a group (or any condition) execute
//! compatible queued work in the meantime instead of idling, which is what keeps a scheduler
//! without any worker threads (or with saturated ones) from deadlocking.
//!
//! The frame tiers tie into a game loop: [`TaskScheduler::finish_frame_tasks`] finishes
//! everything due this frame and promotes the later tiers by one frame, while
//! [`TaskScheduler::execute_some_frame_tasks`] trickles main-thread background work in.

use thiserror::Error;

mod frame;
mod group;
mod priority;
mod scheduler;
mod task;
mod worker;

#[cfg(test)]
mod tests;

pub use group::{GroupFinishedFn, TaskGroupId};
pub use priority::{TaskPriority, WorkerThreadType};
pub use scheduler::{CancelMode, CancelResult, MAX_NESTED_HELPING, SchedulerConfig, SchedulerStats, TaskScheduler};
pub use task::{Task, TaskBuilder, TaskContext, TaskFinishedFn, TaskHandle, TaskNesting};
pub use worker::ThreadUtilization;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0} was never created")]
    UnknownGroup(TaskGroupId),

    #[error("{0} has not been started, waiting for it would never return")]
    GroupNotStarted(TaskGroupId),

    #[error("The task scheduler has been shut down")]
    SchedulerShutDown,

    #[error("Failed to spawn a worker thread")]
    Spawn(#[from] std::io::Error),
}
