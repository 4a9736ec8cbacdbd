//! The scheduler's unit of work.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::system::TaskGroupId;

/// The work a [`Task`] performs.
///
/// `execute` runs once for a task with multiplicity 0. For multiplicity `N`,
/// `execute_with_multiplicity` runs once for every index in `0..N`, possibly
/// on several threads at the same time, so it must not mutate shared state
/// without its own synchronization.
pub trait TaskBody: Send + Sync + 'static {
    fn execute(&self, task: &Task);

    fn execute_with_multiplicity(&self, invocation: u32, task: &Task) {
        let _ = invocation;
        self.execute(task);
    }
}

impl<F> TaskBody for F
where
    F: Fn(&Task) + Send + Sync + 'static,
{
    fn execute(&self, task: &Task) {
        self(task)
    }
}

/// Adapter for closures that want the invocation index.
struct ParallelFn<F>(F);

impl<F> TaskBody for ParallelFn<F>
where
    F: Fn(u32, &Task) + Send + Sync + 'static,
{
    fn execute(&self, task: &Task) {
        (self.0)(0, task)
    }

    fn execute_with_multiplicity(&self, invocation: u32, task: &Task) {
        (self.0)(invocation, task)
    }
}

/// Whether a task may block on other tasks while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskNesting {
    /// Never waits on other tasks; safe to run inline on a waiting thread.
    Never,
    /// May call `wait_for_group`.
    Maybe,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Configured = 0,
    Scheduled = 1,
    Queued = 2,
    Running = 3,
    Finished = 4,
}

struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    fn load(&self) -> TaskState {
        match self.0.load(Ordering::SeqCst) {
            0 => TaskState::Configured,
            1 => TaskState::Scheduled,
            2 => TaskState::Queued,
            3 => TaskState::Running,
            _ => TaskState::Finished,
        }
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

type CompletionCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// A prioritized, cancellable unit of work.
///
/// Build it, wrap it in an `Arc`, and hand it to the
/// [`TaskSystem`](super::TaskSystem). A finished task may be scheduled again.
pub struct Task {
    name: String,
    body: Box<dyn TaskBody>,
    nesting: TaskNesting,
    multiplicity: AtomicU32,
    remaining_runs: AtomicU32,
    state: AtomicTaskState,
    canceled: AtomicBool,
    group: AtomicU64,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Task {
    pub fn new(name: impl Into<String>, body: impl TaskBody) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
            nesting: TaskNesting::Never,
            multiplicity: AtomicU32::new(0),
            remaining_runs: AtomicU32::new(0),
            state: AtomicTaskState(AtomicU8::new(TaskState::Configured as u8)),
            canceled: AtomicBool::new(false),
            group: AtomicU64::new(0),
            on_complete: Mutex::new(None),
        }
    }

    /// A data-parallel task whose closure receives the invocation index.
    pub fn parallel<F>(name: impl Into<String>, multiplicity: u32, body: F) -> Self
    where
        F: Fn(u32, &Task) + Send + Sync + 'static,
    {
        Self::new(name, ParallelFn(body)).with_multiplicity(multiplicity)
    }

    pub fn with_multiplicity(self, multiplicity: u32) -> Self {
        self.multiplicity.store(multiplicity, Ordering::SeqCst);
        self
    }

    pub fn with_nesting(mut self, nesting: TaskNesting) -> Self {
        self.nesting = nesting;
        self
    }

    /// Run `callback` on the executing thread every time the task finishes.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        *self.on_complete.lock().expect("task lock poisoned") = Some(Arc::new(callback));
        self
    }

    /// Change the multiplicity before the task starts executing.
    ///
    /// # Panics
    ///
    /// Panics once the task has been queued for execution.
    pub fn set_multiplicity(&self, multiplicity: u32) {
        let state = self.state.load();
        assert!(
            matches!(
                state,
                TaskState::Configured | TaskState::Scheduled | TaskState::Finished
            ),
            "BUG: multiplicity of task '{}' changed while {:?}",
            self.name,
            state
        );
        self.multiplicity.store(multiplicity, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nesting(&self) -> TaskNesting {
        self.nesting
    }

    pub fn multiplicity(&self) -> u32 {
        self.multiplicity.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Group the task was last scheduled in.
    pub fn group(&self) -> Option<TaskGroupId> {
        match self.group.load(Ordering::SeqCst) {
            0 => None,
            id => Some(TaskGroupId(id)),
        }
    }

    /// Request cooperative cancellation. Runs that have not started are skipped.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Polled by task bodies at safe points.
    pub fn has_been_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Reliable until the task is scheduled again.
    pub fn is_finished(&self) -> bool {
        self.state.load() == TaskState::Finished
    }

    pub(crate) fn mark_scheduled(&self, group: TaskGroupId) {
        let state = self.state.load();
        assert!(
            matches!(state, TaskState::Configured | TaskState::Finished),
            "BUG: task '{}' scheduled while {:?}",
            self.name,
            state
        );
        self.canceled.store(false, Ordering::SeqCst);
        self.group.store(group.0, Ordering::SeqCst);
        self.state.store(TaskState::Scheduled);
    }

    /// Move to `Queued` and return the invocation indices to enqueue.
    pub(crate) fn mark_queued(&self) -> Vec<Option<u32>> {
        let multiplicity = self.multiplicity();
        let invocations: Vec<Option<u32>> = if multiplicity == 0 {
            vec![None]
        } else {
            (0..multiplicity).map(Some).collect()
        };
        self.remaining_runs
            .store(invocations.len() as u32, Ordering::SeqCst);
        self.state.store(TaskState::Queued);
        invocations
    }

    pub(crate) fn invoke(&self, invocation: Option<u32>) {
        self.state.transition(TaskState::Queued, TaskState::Running);
        if self.has_been_canceled() {
            return;
        }
        match invocation {
            None => self.body.execute(self),
            Some(index) => self.body.execute_with_multiplicity(index, self),
        }
    }

    /// Count one run as done. Returns `true` for the last run.
    pub(crate) fn complete_run(&self) -> bool {
        self.remaining_runs.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub(crate) fn finish(&self) {
        self.state.store(TaskState::Finished);
        let callback = self.on_complete.lock().expect("task lock poisoned").clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("multiplicity", &self.multiplicity())
            .field("canceled", &self.has_been_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_new_task_is_configured() {
        let task = Task::new("noop", |_: &Task| {});
        assert_eq!(task.state(), TaskState::Configured);
        assert_eq!(task.multiplicity(), 0);
        assert_eq!(task.nesting(), TaskNesting::Never);
        assert!(task.group().is_none());
    }

    #[test]
    fn test_single_run_lifecycle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new("count", move |_: &Task| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        task.mark_scheduled(TaskGroupId(7));
        assert_eq!(task.group(), Some(TaskGroupId(7)));
        let runs = task.mark_queued();
        assert_eq!(runs, vec![None]);

        task.invoke(None);
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.complete_run());
        task.finish();

        assert!(task.is_finished());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiplicity_runs_each_index() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let task = Task::parallel("fan-out", 3, move |i, _| {
            s.lock().unwrap().push(i);
        });

        task.mark_scheduled(TaskGroupId(1));
        let runs = task.mark_queued();
        assert_eq!(runs, vec![Some(0), Some(1), Some(2)]);
        for run in runs {
            task.invoke(run);
        }

        assert!(!task.complete_run());
        assert!(!task.complete_run());
        assert!(task.complete_run());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_canceled_task_skips_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new("skipped", move |_: &Task| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        task.mark_scheduled(TaskGroupId(1));
        task.mark_queued();
        task.cancel();
        task.invoke(None);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.has_been_canceled());
    }

    #[test]
    fn test_completion_callback_runs_on_finish() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let task = Task::new("cb", |_: &Task| {}).on_complete(move |t| {
            assert!(t.is_finished());
            d.fetch_add(1, Ordering::SeqCst);
        });

        task.finish();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "BUG: multiplicity")]
    fn test_set_multiplicity_after_queue_panics() {
        let task = Task::new("late", |_: &Task| {});
        task.mark_scheduled(TaskGroupId(1));
        task.set_multiplicity(2);
        task.mark_queued();
        task.set_multiplicity(4);
    }
}
