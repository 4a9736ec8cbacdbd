//! Worker threads of the task system.
//!
//! Steady-state threads keep pulling tasks from their priority band until it is
//! empty. Reserve threads (index at or above the pool's `max_workers_to_use`)
//! run a single task per wake-up, go idle, and forward the wake-up to one peer,
//! so bursts get absorbed without the reserve permanently draining the queue.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use super::system::SystemShared;
use super::types::{AtomicWorkerState, WorkerState, WorkerThreadType};
use crate::sync::Signal;

/// Per-thread bookkeeping shared between the thread and the task system.
pub(crate) struct WorkerThread {
    kind: WorkerThreadType,
    index: usize,
    state: AtomicWorkerState,
    wake: Signal,
    deactivated: AtomicBool,
    active_nanos: AtomicU64,
    utilization_bits: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_this_wake: AtomicU32,
    max_tasks_per_wake: AtomicU32,
    wake_ups: AtomicU64,
    self_resumes: AtomicU64,
}

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub kind: WorkerThreadType,
    pub index: usize,
    pub is_reserve: bool,
    pub state: WorkerState,
    pub tasks_executed: u64,
    /// Most tasks executed between two consecutive wake-ups.
    pub max_tasks_per_wake: u32,
    /// Times the thread was woken from idle by another thread.
    pub wake_ups: u64,
    /// Times the thread found work while going idle and carried on unwoken.
    pub self_resumes: u64,
    /// Fraction of the last utilization window spent executing tasks.
    pub utilization: f64,
}

impl WorkerThread {
    pub(crate) fn new(kind: WorkerThreadType, index: usize) -> Self {
        Self {
            kind,
            index,
            // Threads start active and go idle on their first empty poll.
            state: AtomicWorkerState::new(WorkerState::Active),
            wake: Signal::new(),
            deactivated: AtomicBool::new(false),
            active_nanos: AtomicU64::new(0),
            utilization_bits: AtomicU64::new(0f64.to_bits()),
            tasks_executed: AtomicU64::new(0),
            tasks_this_wake: AtomicU32::new(0),
            max_tasks_per_wake: AtomicU32::new(0),
            wake_ups: AtomicU64::new(0),
            self_resumes: AtomicU64::new(0),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state.load()
    }

    /// Wake this thread if it is idle. Returns `true` if it was woken.
    pub(crate) fn try_wake(&self) -> bool {
        if self.state.transition(WorkerState::Idle, WorkerState::Active) {
            self.wake.raise();
            true
        } else {
            false
        }
    }

    /// Ask the thread to exit and wake it once so it observes the request.
    pub(crate) fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
        self.state.store(WorkerState::Active);
        self.wake.raise();
    }

    fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    fn record_task(&self, elapsed: Duration) {
        self.active_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        let this_wake = self.tasks_this_wake.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_tasks_per_wake
            .fetch_max(this_wake, Ordering::Relaxed);
    }

    /// Compute `active / elapsed` for the window since the last call and reset.
    pub(crate) fn update_utilization(&self, elapsed: Duration) -> f64 {
        let active = self.active_nanos.swap(0, Ordering::Relaxed);
        let utilization = if elapsed.is_zero() {
            0.0
        } else {
            (active as f64 / elapsed.as_nanos() as f64).min(1.0)
        };
        self.utilization_bits
            .store(utilization.to_bits(), Ordering::Relaxed);
        utilization
    }

    pub(crate) fn utilization(&self) -> f64 {
        f64::from_bits(self.utilization_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn stats(&self, max_workers_to_use: usize) -> WorkerStats {
        WorkerStats {
            kind: self.kind,
            index: self.index,
            is_reserve: self.index >= max_workers_to_use,
            state: self.state(),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            max_tasks_per_wake: self.max_tasks_per_wake.load(Ordering::Relaxed),
            wake_ups: self.wake_ups.load(Ordering::Relaxed),
            self_resumes: self.self_resumes.load(Ordering::Relaxed),
            utilization: self.utilization(),
        }
    }

    /// Thread main loop.
    pub(crate) fn run(self: Arc<Self>, system: Arc<SystemShared>) {
        debug!("Worker {}-{} started", self.kind, self.index);

        while !self.is_deactivated() {
            let reserve = self.index >= system.max_workers_to_use(self.kind);

            if reserve {
                if let Some(elapsed) = system.try_execute_one(self.kind) {
                    self.record_task(elapsed);
                    // Hand the baton on instead of draining the queue.
                    self.state.store(WorkerState::Idle);
                    system.wake_up_threads(self.kind, 1);
                }
                self.wait_for_work(&system);
            } else if let Some(elapsed) = system.try_execute_one(self.kind) {
                self.record_task(elapsed);
            } else {
                self.wait_for_work(&system);
            }
        }

        debug!("Worker {}-{} stopped", self.kind, self.index);
    }

    fn wait_for_work(&self, system: &SystemShared) {
        self.state.store(WorkerState::Idle);

        // A producer may have queued work after our last poll but before we
        // went idle; it would have found us active and not woken us.
        let resumed = system.has_work(self.kind)
            && self.state.transition(WorkerState::Idle, WorkerState::Active);

        if resumed {
            self.begin_wake(true);
        } else {
            if !self.is_deactivated() {
                trace!("Worker {}-{} waiting for work", self.kind, self.index);
                self.wake.wait(None);
            }
            self.state.store(WorkerState::Active);
            self.begin_wake(false);
        }
    }

    /// Start a new per-wake task count.
    fn begin_wake(&self, self_resumed: bool) {
        let counter = if self_resumed {
            &self.self_resumes
        } else {
            &self.wake_ups
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.tasks_this_wake.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_wake_only_wakes_idle_threads() {
        let worker = WorkerThread::new(WorkerThreadType::LongTasks, 0);
        assert!(!worker.try_wake());

        worker.state.store(WorkerState::Idle);
        assert!(worker.try_wake());
        assert_eq!(worker.state(), WorkerState::Active);
        assert!(worker.wake.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_tasks_per_wake_counts_between_wakes() {
        let worker = WorkerThread::new(WorkerThreadType::LongTasks, 0);
        for _ in 0..3 {
            worker.record_task(Duration::ZERO);
        }
        worker.begin_wake(false);
        worker.record_task(Duration::ZERO);
        worker.begin_wake(true);

        let stats = worker.stats(1);
        assert_eq!(stats.tasks_executed, 4);
        assert_eq!(stats.max_tasks_per_wake, 3);
        assert_eq!(stats.wake_ups, 1);
        assert_eq!(stats.self_resumes, 1);
    }

    #[test]
    fn test_utilization_is_fraction_and_resets() {
        let worker = WorkerThread::new(WorkerThreadType::ShortTasks, 0);
        worker.record_task(Duration::from_millis(25));
        worker.record_task(Duration::from_millis(25));

        let u = worker.update_utilization(Duration::from_millis(100));
        assert!((u - 0.5).abs() < 1e-9);
        assert!((worker.utilization() - 0.5).abs() < 1e-9);

        assert_eq!(worker.update_utilization(Duration::from_millis(100)), 0.0);
    }

    #[test]
    fn test_stats_track_tasks_per_wake() {
        let worker = WorkerThread::new(WorkerThreadType::LongTasks, 2);
        worker.record_task(Duration::ZERO);
        worker.record_task(Duration::ZERO);
        worker.tasks_this_wake.store(0, Ordering::Relaxed);
        worker.record_task(Duration::ZERO);

        let stats = worker.stats(1);
        assert!(stats.is_reserve);
        assert_eq!(stats.tasks_executed, 3);
        assert_eq!(stats.max_tasks_per_wake, 2);
    }
}
