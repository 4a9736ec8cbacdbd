//! Prioritized multi-threaded task scheduler.
//!
//! Tasks are queued per [`TaskPriority`]; each [`WorkerThreadType`] pool serves a
//! contiguous band of priorities. Pools keep `max_workers_to_use` threads busy
//! while work is queued and hold a few reserve threads that take one task per
//! wake-up, so a burst of long work cannot starve the steady-state threads of
//! other subsystems.

mod system;
mod types;
mod unit;
mod worker;

pub use system::{TaskGroupId, TaskSystem};
pub use types::{TaskPriority, WorkerState, WorkerThreadType};
pub use unit::{Task, TaskBody, TaskNesting, TaskState};
pub use worker::WorkerStats;
