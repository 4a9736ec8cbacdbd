//! Priorities, worker thread types and states shared by the scheduler.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Scheduling priority of a task. Lower values are picked first within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    EarlyThisFrame = 0,
    ThisFrame = 1,
    LateThisFrame = 2,
    EarlyNextFrame = 3,
    NextFrame = 4,
    LateNextFrame = 5,
    InNFrames = 6,
    LongRunningHighPriority = 7,
    LongRunning = 8,
    FileAccessHighPriority = 9,
    FileAccess = 10,
}

impl TaskPriority {
    pub const COUNT: usize = 11;

    pub const ALL: [TaskPriority; Self::COUNT] = [
        TaskPriority::EarlyThisFrame,
        TaskPriority::ThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyNextFrame,
        TaskPriority::NextFrame,
        TaskPriority::LateNextFrame,
        TaskPriority::InNFrames,
        TaskPriority::LongRunningHighPriority,
        TaskPriority::LongRunning,
        TaskPriority::FileAccessHighPriority,
        TaskPriority::FileAccess,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The pool whose threads execute tasks of this priority.
    pub fn worker_type(self) -> WorkerThreadType {
        match self {
            TaskPriority::LongRunningHighPriority | TaskPriority::LongRunning => {
                WorkerThreadType::LongTasks
            }
            TaskPriority::FileAccessHighPriority | TaskPriority::FileAccess => {
                WorkerThreadType::FileAccess
            }
            _ => WorkerThreadType::ShortTasks,
        }
    }
}

/// Category of worker thread. Each category owns a contiguous priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerThreadType {
    ShortTasks = 0,
    LongTasks = 1,
    FileAccess = 2,
}

impl WorkerThreadType {
    pub const COUNT: usize = 3;

    pub const ALL: [WorkerThreadType; Self::COUNT] = [
        WorkerThreadType::ShortTasks,
        WorkerThreadType::LongTasks,
        WorkerThreadType::FileAccess,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Inclusive `[first, last]` priority band served by this worker type.
    pub fn priority_range(self) -> (TaskPriority, TaskPriority) {
        match self {
            WorkerThreadType::ShortTasks => (TaskPriority::EarlyThisFrame, TaskPriority::InNFrames),
            WorkerThreadType::LongTasks => {
                (TaskPriority::LongRunningHighPriority, TaskPriority::LongRunning)
            }
            WorkerThreadType::FileAccess => {
                (TaskPriority::FileAccessHighPriority, TaskPriority::FileAccess)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerThreadType::ShortTasks => "short",
            WorkerThreadType::LongTasks => "long",
            WorkerThreadType::FileAccess => "file",
        }
    }
}

impl std::fmt::Display for WorkerThreadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a worker thread is waiting for work or busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle = 0,
    Active = 1,
}

/// Atomic wrapper for WorkerState.
pub(crate) struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    pub(crate) fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> WorkerState {
        match self.0.load(Ordering::SeqCst) {
            0 => WorkerState::Idle,
            _ => WorkerState::Active,
        }
    }

    pub(crate) fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Transition `from -> to`; fails if another thread changed the state first.
    pub(crate) fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_cover_every_priority_once() {
        for priority in TaskPriority::ALL {
            let kind = priority.worker_type();
            let (first, last) = kind.priority_range();
            assert!(priority >= first && priority <= last, "{priority:?} outside {kind}");
        }
    }

    #[test]
    fn test_long_running_goes_to_long_pool() {
        assert_eq!(
            TaskPriority::LongRunning.worker_type(),
            WorkerThreadType::LongTasks
        );
        assert_eq!(
            TaskPriority::ThisFrame.worker_type(),
            WorkerThreadType::ShortTasks
        );
    }

    #[test]
    fn test_worker_state_transition_is_compare_and_swap() {
        let state = AtomicWorkerState::new(WorkerState::Idle);
        assert!(state.transition(WorkerState::Idle, WorkerState::Active));
        assert!(!state.transition(WorkerState::Idle, WorkerState::Active));
        assert_eq!(state.load(), WorkerState::Active);
    }
}
