//! The task system: priority queues, task groups and worker pools.
//!
//! # Thread Safety
//!
//! Lock order is `groups` before `queues`. Completion callbacks and thread
//! wake-ups run after both locks are released.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::types::{TaskPriority, WorkerThreadType};
use super::unit::{Task, TaskNesting};
use super::worker::{WorkerStats, WorkerThread};
use crate::config::{TaskConfig, TaskSystemConfig, WorkerPoolConfig};
use crate::Result;

/// Identifies a task group. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskGroupId(pub(crate) u64);

impl std::fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

thread_local! {
    static CURRENT_NESTING: Cell<Option<TaskNesting>> = const { Cell::new(None) };
}

struct Job {
    task: Arc<Task>,
    invocation: Option<u32>,
}

type GroupCallback = Arc<dyn Fn(TaskGroupId) + Send + Sync>;

struct TaskGroup {
    priority: TaskPriority,
    tasks: Vec<Arc<Task>>,
    remaining_tasks: usize,
    pending_dependencies: usize,
    dependents: Vec<TaskGroupId>,
    started: bool,
    on_finished: Option<GroupCallback>,
}

#[derive(Default)]
struct GroupTable {
    next_id: u64,
    groups: HashMap<TaskGroupId, TaskGroup>,
}

/// Work produced while holding the group lock, applied after releasing it.
#[derive(Default)]
struct Deferred {
    wakes: Vec<(WorkerThreadType, usize)>,
    callbacks: Vec<(GroupCallback, TaskGroupId)>,
}

struct WorkerPool {
    max_workers_to_use: AtomicUsize,
    workers: Vec<Arc<WorkerThread>>,
}

/// State shared by the task system handle and every worker thread.
pub(crate) struct SystemShared {
    queues: Mutex<Vec<VecDeque<Job>>>,
    groups: Mutex<GroupTable>,
    group_finished: Condvar,
    pools: Vec<WorkerPool>,
}

impl SystemShared {
    pub(crate) fn max_workers_to_use(&self, kind: WorkerThreadType) -> usize {
        self.pools[kind.index()]
            .max_workers_to_use
            .load(Ordering::SeqCst)
    }

    pub(crate) fn has_work(&self, kind: WorkerThreadType) -> bool {
        let (first, last) = kind.priority_range();
        let queues = self.queues.lock().expect("queue lock poisoned");
        queues[first.index()..=last.index()]
            .iter()
            .any(|q| !q.is_empty())
    }

    /// Wake up to `count` idle threads of `kind`, front of the pool first.
    pub(crate) fn wake_up_threads(&self, kind: WorkerThreadType, count: usize) -> usize {
        let mut woken = 0;
        if count == 0 {
            return woken;
        }
        for worker in &self.pools[kind.index()].workers {
            if worker.try_wake() {
                woken += 1;
                if woken == count {
                    break;
                }
            }
        }
        woken
    }

    fn pop_job(&self, kind: WorkerThreadType) -> Option<Job> {
        let (first, last) = kind.priority_range();
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        queues[first.index()..=last.index()]
            .iter_mut()
            .find_map(|q| q.pop_front())
    }

    /// Take the highest-priority job that never blocks, from any band.
    fn pop_helpable_job(&self) -> Option<Job> {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        for queue in queues.iter_mut() {
            if let Some(pos) = queue
                .iter()
                .position(|job| job.task.nesting() == TaskNesting::Never)
            {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Execute one task from the band of `kind`. Returns the time spent.
    pub(crate) fn try_execute_one(&self, kind: WorkerThreadType) -> Option<Duration> {
        let job = self.pop_job(kind)?;
        Some(self.execute_job(job))
    }

    fn execute_job(&self, job: Job) -> Duration {
        let start = Instant::now();
        let task = job.task;

        let previous = CURRENT_NESTING.with(|n| n.replace(Some(task.nesting())));
        let outcome = catch_unwind(AssertUnwindSafe(|| task.invoke(job.invocation)));
        CURRENT_NESTING.with(|n| n.set(previous));

        if outcome.is_err() {
            error!("Task '{}' panicked; counting the run as done", task.name());
        }

        if task.complete_run() {
            self.finish_task(&task);
        }

        start.elapsed()
    }

    fn finish_task(&self, task: &Task) {
        task.finish();
        if let Some(group) = task.group() {
            self.on_group_task_finished(group);
        }
    }

    fn on_group_task_finished(&self, id: TaskGroupId) {
        let mut deferred = Deferred::default();
        {
            let mut table = self.groups.lock().expect("group lock poisoned");
            let done = match table.groups.get_mut(&id) {
                Some(group) => {
                    group.remaining_tasks = group.remaining_tasks.saturating_sub(1);
                    group.remaining_tasks == 0
                }
                None => false,
            };
            if done {
                self.finish_group_locked(&mut table, id, &mut deferred);
            }
        }
        self.apply(deferred);
    }

    /// Push every task of `group` onto the queues. Returns the number of tasks.
    fn queue_group_locked(&self, group: &mut TaskGroup, deferred: &mut Deferred) -> usize {
        let mut jobs = 0;
        {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            let queue = &mut queues[group.priority.index()];
            for task in &group.tasks {
                for invocation in task.mark_queued() {
                    queue.push_back(Job {
                        task: Arc::clone(task),
                        invocation,
                    });
                    jobs += 1;
                }
            }
        }
        deferred.wakes.push((group.priority.worker_type(), jobs));
        group.tasks.len()
    }

    fn finish_group_locked(&self, table: &mut GroupTable, id: TaskGroupId, deferred: &mut Deferred) {
        let mut finished = vec![id];
        while let Some(id) = finished.pop() {
            let Some(group) = table.groups.remove(&id) else {
                continue;
            };
            debug!("Task {} finished", id);
            if let Some(callback) = group.on_finished {
                deferred.callbacks.push((callback, id));
            }
            for dependent_id in group.dependents {
                let Some(dependent) = table.groups.get_mut(&dependent_id) else {
                    continue;
                };
                dependent.pending_dependencies -= 1;
                if dependent.pending_dependencies == 0
                    && dependent.started
                    && self.queue_group_locked(dependent, deferred) == 0
                {
                    finished.push(dependent_id);
                }
            }
        }
    }

    fn apply(&self, deferred: Deferred) {
        self.group_finished.notify_all();
        for (callback, id) in deferred.callbacks {
            callback(id);
        }
        for (kind, count) in deferred.wakes {
            self.wake_up_threads(kind, count);
        }
    }
}

/// Prioritized multi-threaded task scheduler.
///
/// Owns one worker pool per [`WorkerThreadType`]. Dropping the system stops
/// and joins every worker; queued tasks that never started are discarded.
pub struct TaskSystem {
    shared: Arc<SystemShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TaskSystem {
    /// Spawn the worker pools described by `config`.
    pub fn new(config: TaskSystemConfig) -> Result<Self> {
        let pool_configs = [config.short_tasks, config.long_tasks, config.file_access];

        let pools: Vec<WorkerPool> = WorkerThreadType::ALL
            .iter()
            .zip(pool_configs.iter())
            .map(|(kind, pool)| WorkerPool {
                max_workers_to_use: AtomicUsize::new(pool.max_workers_to_use),
                workers: (0..pool.total())
                    .map(|index| Arc::new(WorkerThread::new(*kind, index)))
                    .collect(),
            })
            .collect();

        let shared = Arc::new(SystemShared {
            queues: Mutex::new((0..TaskPriority::COUNT).map(|_| VecDeque::new()).collect()),
            groups: Mutex::new(GroupTable {
                next_id: 1,
                groups: HashMap::new(),
            }),
            group_finished: Condvar::new(),
            pools,
        });

        let system = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        for (kind, pool) in WorkerThreadType::ALL.iter().zip(shared.pools.iter()) {
            for worker in &pool.workers {
                let worker = Arc::clone(worker);
                let shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("hearth-{}-{}", kind, worker.index()))
                    .spawn(move || worker.run(shared))?;
                system
                    .threads
                    .lock()
                    .expect("thread list lock poisoned")
                    .push(handle);
            }
        }

        info!(
            "Task system started: short={:?} long={:?} file={:?}",
            config.short_tasks, config.long_tasks, config.file_access
        );
        Ok(system)
    }

    /// Create an empty group whose tasks will run at `priority`.
    pub fn create_task_group(&self, priority: TaskPriority) -> TaskGroupId {
        let mut table = self.shared.groups.lock().expect("group lock poisoned");
        let id = TaskGroupId(table.next_id);
        table.next_id += 1;
        table.groups.insert(
            id,
            TaskGroup {
                priority,
                tasks: Vec::new(),
                remaining_tasks: 0,
                pending_dependencies: 0,
                dependents: Vec::new(),
                started: false,
                on_finished: None,
            },
        );
        id
    }

    /// # Panics
    ///
    /// Panics if the group is unknown or already started.
    pub fn add_task_to_group(&self, group: TaskGroupId, task: Arc<Task>) {
        let mut table = self.shared.groups.lock().expect("group lock poisoned");
        let entry = table
            .groups
            .get_mut(&group)
            .unwrap_or_else(|| panic!("BUG: task added to unknown or finished {group}"));
        assert!(!entry.started, "BUG: task added to already started {group}");
        task.mark_scheduled(group);
        entry.tasks.push(task);
        entry.remaining_tasks += 1;
    }

    /// Make `group` wait until `depends_on` has finished.
    ///
    /// A dependency that already finished is satisfied immediately.
    pub fn add_task_group_dependency(&self, group: TaskGroupId, depends_on: TaskGroupId) {
        let mut table = self.shared.groups.lock().expect("group lock poisoned");
        assert!(
            table.groups.get(&group).is_some_and(|g| !g.started),
            "BUG: dependency added to unknown or started {group}"
        );
        let Some(dependency) = table.groups.get_mut(&depends_on) else {
            return;
        };
        dependency.dependents.push(group);
        if let Some(entry) = table.groups.get_mut(&group) {
            entry.pending_dependencies += 1;
        }
    }

    /// Run `callback` (on the finishing thread) once the group has finished.
    pub fn on_group_finished<F>(&self, group: TaskGroupId, callback: F)
    where
        F: Fn(TaskGroupId) + Send + Sync + 'static,
    {
        let mut table = self.shared.groups.lock().expect("group lock poisoned");
        if let Some(entry) = table.groups.get_mut(&group) {
            entry.on_finished = Some(Arc::new(callback));
        }
    }

    /// Queue the group's tasks once all of its dependencies have finished.
    pub fn start_task_group(&self, group: TaskGroupId) {
        let mut deferred = Deferred::default();
        {
            let mut table = self.shared.groups.lock().expect("group lock poisoned");
            let Some(entry) = table.groups.get_mut(&group) else {
                warn!("Ignoring start of unknown {}", group);
                return;
            };
            assert!(!entry.started, "BUG: {group} started twice");
            entry.started = true;

            if entry.pending_dependencies == 0
                && self.shared.queue_group_locked(entry, &mut deferred) == 0
            {
                self.shared
                    .finish_group_locked(&mut table, group, &mut deferred);
            }
        }
        self.shared.apply(deferred);
    }

    /// Schedule a single task in its own group.
    pub fn start_single_task(&self, task: Arc<Task>, priority: TaskPriority) -> TaskGroupId {
        let group = self.create_task_group(priority);
        self.add_task_to_group(group, task);
        self.start_task_group(group);
        group
    }

    pub fn is_task_group_finished(&self, group: TaskGroupId) -> bool {
        !self
            .shared
            .groups
            .lock()
            .expect("group lock poisoned")
            .groups
            .contains_key(&group)
    }

    /// Block until `group` finished, executing non-blocking tasks meanwhile.
    ///
    /// # Panics
    ///
    /// Panics when called from a task declared with [`TaskNesting::Never`].
    pub fn wait_for_group(&self, group: TaskGroupId) {
        let nesting = CURRENT_NESTING.with(|n| n.get());
        assert!(
            nesting != Some(TaskNesting::Never),
            "BUG: task declared TaskNesting::Never waited on {group}"
        );

        loop {
            if self.is_task_group_finished(group) {
                return;
            }
            if let Some(job) = self.shared.pop_helpable_job() {
                self.shared.execute_job(job);
                continue;
            }
            let table = self.shared.groups.lock().expect("group lock poisoned");
            if !table.groups.contains_key(&group) {
                return;
            }
            let _ = self
                .shared
                .group_finished
                .wait_timeout(table, TaskConfig::GROUP_WAIT_POLL_INTERVAL)
                .expect("group lock poisoned");
        }
    }

    /// Cancel a task. Queued runs that have not started are dropped.
    ///
    /// Returns `true` if the task had not started running yet. A running task
    /// only stops once its body polls [`Task::has_been_canceled`].
    pub fn cancel_task(&self, task: &Arc<Task>) -> bool {
        task.cancel();

        let removed = {
            let mut queues = self.shared.queues.lock().expect("queue lock poisoned");
            let mut removed = 0;
            for queue in queues.iter_mut() {
                let before = queue.len();
                queue.retain(|job| !Arc::ptr_eq(&job.task, task));
                removed += before - queue.len();
            }
            removed
        };

        let mut last = false;
        for _ in 0..removed {
            last = task.complete_run();
        }
        if last {
            self.shared.finish_task(task);
        }
        removed > 0
    }

    /// Change how many threads of `kind` keep pulling work; the rest act as reserve.
    pub fn set_max_workers_to_use(&self, kind: WorkerThreadType, count: usize) {
        let pool = &self.shared.pools[kind.index()];
        let count = count.clamp(1, pool.workers.len().max(1));
        pool.max_workers_to_use.store(count, Ordering::SeqCst);
    }

    pub fn max_workers_to_use(&self, kind: WorkerThreadType) -> usize {
        self.shared.max_workers_to_use(kind)
    }

    pub fn wake_up_threads(&self, kind: WorkerThreadType, count: usize) -> usize {
        self.shared.wake_up_threads(kind, count)
    }

    /// Recompute every worker's utilization over `elapsed` and reset the counters.
    pub fn update_thread_utilization(&self, elapsed: Duration) {
        for pool in &self.shared.pools {
            for worker in &pool.workers {
                worker.update_utilization(elapsed);
            }
        }
    }

    pub fn worker_stats(&self, kind: WorkerThreadType) -> Vec<WorkerStats> {
        let pool = &self.shared.pools[kind.index()];
        let max = pool.max_workers_to_use.load(Ordering::SeqCst);
        pool.workers.iter().map(|w| w.stats(max)).collect()
    }

    pub fn pool_config(&self, kind: WorkerThreadType) -> WorkerPoolConfig {
        let pool = &self.shared.pools[kind.index()];
        let max = pool.max_workers_to_use.load(Ordering::SeqCst);
        WorkerPoolConfig::new(max, pool.workers.len().saturating_sub(max))
    }

    /// Number of jobs waiting in the queues of `kind`.
    pub fn queued_jobs(&self, kind: WorkerThreadType) -> usize {
        let (first, last) = kind.priority_range();
        let queues = self.shared.queues.lock().expect("queue lock poisoned");
        queues[first.index()..=last.index()]
            .iter()
            .map(VecDeque::len)
            .sum()
    }

    /// Stop and join all worker threads.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in &self.shared.pools {
            for worker in &pool.workers {
                worker.deactivate();
            }
        }
        let handles: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .expect("thread list lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        info!("Task system stopped");
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
