//! Engine side of long operations.
//!
//! The manager listens for replication and cancel messages on a
//! [`ProcessCommunicationChannel`], instantiates the requested worker, runs it
//! on the [`TaskSystem`] at [`TaskPriority::LongRunning`] and relays progress
//! and the result back to the requester.
//!
//! # Thread Safety
//!
//! The operation table is a single mutex. Sends happen while it is held, so
//! message handlers reached from here must never call back into the manager.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::progress::{Progress, ProgressEvent};
use super::worker::{LongOpWorker, WorkerRegistry};
use crate::config::{LongOpConfig, TaskConfig};
use crate::event::{Subscription, SubscriptionId};
use crate::ipc::communication::ProcessCommunicationChannel;
use crate::ipc::message::{
    LongOpProgressMsg, LongOpReplicationMsg, LongOpResultMsg, ProcessMessage,
};
use crate::ipc::stream::{StreamReader, StreamWriter};
use crate::task::{
    Task, TaskBody, TaskGroupId, TaskNesting, TaskPriority, TaskState, TaskSystem,
};

/// Tracking entry for one in-flight operation.
struct WorkerOpInfo {
    document_guid: Uuid,
    operation_type: String,
    progress: Arc<Progress>,
    _progress_subscription: Subscription<ProgressEvent>,
    /// Owned here until launch, then by the task.
    worker: Option<Box<dyn LongOpWorker>>,
    task: Option<Arc<Task>>,
    task_group: Option<TaskGroupId>,
    started_at: Instant,
}

/// Snapshot of an in-flight operation.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_guid: Uuid,
    pub document_guid: Uuid,
    pub operation_type: String,
    pub completion: f32,
    pub cancel_requested: bool,
    /// Scheduler state of the operation's task, once launched.
    pub task_state: Option<TaskState>,
    pub task_group: Option<TaskGroupId>,
    pub running_for_ms: u64,
}

/// Decides which completion updates go on the wire.
struct ProgressForwarder {
    min_delta: f32,
    last_sent: Mutex<Option<f32>>,
}

impl ProgressForwarder {
    fn should_send(&self, completion: f32) -> bool {
        let mut last_sent = self.last_sent.lock().expect("progress lock poisoned");
        let send = completion <= 0.0
            || completion >= 1.0
            || last_sent.map_or(true, |last| (completion - last).abs() >= self.min_delta);
        if send {
            *last_sent = Some(completion);
        }
        send
    }
}

pub struct LongOpWorkerManager {
    comm: Arc<ProcessCommunicationChannel>,
    tasks: Arc<TaskSystem>,
    registry: WorkerRegistry,
    config: LongOpConfig,
    ops: Mutex<HashMap<Uuid, WorkerOpInfo>>,
    message_subscription: Mutex<Option<SubscriptionId>>,
    self_ref: Weak<Self>,
}

impl LongOpWorkerManager {
    /// Create the manager and subscribe it to `comm`'s message events.
    pub fn new(
        comm: Arc<ProcessCommunicationChannel>,
        tasks: Arc<TaskSystem>,
        registry: WorkerRegistry,
        config: LongOpConfig,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|self_ref: &Weak<Self>| Self {
            comm,
            tasks,
            registry,
            config,
            ops: Mutex::new(HashMap::new()),
            message_subscription: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let weak = Arc::downgrade(&manager);
        let id = manager.comm.events().subscribe(move |message: &ProcessMessage| {
            if let Some(manager) = weak.upgrade() {
                manager.on_message(message);
            }
        });
        *manager
            .message_subscription
            .lock()
            .expect("subscription lock poisoned") = Some(id);

        info!(
            "Long operation manager ready: {:?}",
            manager.registry.type_names()
        );
        manager
    }

    fn on_message(&self, message: &ProcessMessage) {
        match message {
            ProcessMessage::LongOpReplication(msg) => self.replicate_operation(msg),
            ProcessMessage::LongOpCancel(msg) => {
                self.cancel_operation(msg.operation_guid);
            }
            _ => {}
        }
    }

    fn replicate_operation(&self, msg: &LongOpReplicationMsg) {
        let guid = msg.operation_guid;

        let Some(worker) = self.registry.create(&msg.replication_type) else {
            error!(
                "Unknown long operation type '{}' requested for {}",
                msg.replication_type, guid
            );
            // The requester would otherwise wait for a result forever.
            self.send_result(guid, false, Bytes::new());
            return;
        };

        let progress = Arc::new(Progress::new());
        let forwarder = Arc::new(ProgressForwarder {
            min_delta: self.config.progress_min_delta,
            last_sent: Mutex::new(None),
        });

        {
            let mut ops = self.ops.lock().expect("ops lock poisoned");
            if ops.contains_key(&guid) {
                warn!("Ignoring duplicate long operation {}", guid);
                return;
            }

            let weak = self.self_ref.clone();
            let forward = Arc::clone(&forwarder);
            let subscription =
                progress
                    .events()
                    .subscribe_scoped(move |event: &ProgressEvent| {
                        if let ProgressEvent::CompletionChanged(completion) = *event {
                            if forward.should_send(completion) {
                                if let Some(manager) = weak.upgrade() {
                                    manager.send_progress(guid, completion);
                                }
                            }
                        }
                    });

            ops.insert(
                guid,
                WorkerOpInfo {
                    document_guid: msg.document_guid,
                    operation_type: msg.replication_type.clone(),
                    progress,
                    _progress_subscription: subscription,
                    worker: Some(worker),
                    task: None,
                    task_group: None,
                    started_at: Instant::now(),
                },
            );
        }

        debug!(
            "Replicated long operation {} of type '{}'",
            guid, msg.replication_type
        );
        self.launch_worker_operation(guid, msg.replication_data.clone(), &forwarder);
    }

    fn launch_worker_operation(&self, guid: Uuid, config: Bytes, forwarder: &ProgressForwarder) {
        let launch = {
            let mut ops = self.ops.lock().expect("ops lock poisoned");
            ops.get_mut(&guid).and_then(|info| {
                info.worker.take().map(|worker| {
                    (
                        worker,
                        Arc::clone(&info.progress),
                        info.document_guid,
                        info.operation_type.clone(),
                    )
                })
            })
        };
        let Some((mut worker, progress, document_guid, operation_type)) = launch else {
            return;
        };

        forwarder.should_send(0.0);
        self.send_progress(guid, 0.0);

        let mut reader = StreamReader::new(config);
        if let Err(e) = worker.initialize_execution(&mut reader, document_guid) {
            warn!(
                "Long operation {} ('{}') failed to initialize: {}",
                guid, operation_type, e
            );
            self.worker_operation_finished(guid, false, Bytes::new());
            return;
        }

        let weak = self.self_ref.clone();
        let body = LongOpTask {
            manager: self.self_ref.clone(),
            guid,
            progress,
            worker: Mutex::new(Some(worker)),
        };
        let task = Arc::new(
            Task::new(format!("LongOp {operation_type} {guid}"), body)
                .with_nesting(TaskNesting::Never)
                .on_complete(move |_| {
                    // Covers runs skipped by scheduler-level cancellation; a
                    // no-op when the body already reported.
                    if let Some(manager) = weak.upgrade() {
                        manager.worker_operation_finished(guid, false, Bytes::new());
                    }
                }),
        );

        let group = self
            .tasks
            .start_single_task(Arc::clone(&task), TaskPriority::LongRunning);

        let mut ops = self.ops.lock().expect("ops lock poisoned");
        if let Some(info) = ops.get_mut(&guid) {
            info.task = Some(task);
            info.task_group = Some(group);
        }
    }

    /// Report the outcome and forget the operation. Safe from any thread; a
    /// second call for the same operation does nothing.
    pub fn worker_operation_finished(&self, guid: Uuid, success: bool, result_data: Bytes) {
        let mut ops = self.ops.lock().expect("ops lock poisoned");
        let Some(info) = ops.get(&guid) else {
            return;
        };
        info!(
            "Long operation {} ('{}') finished: success={} result={} bytes in {:?}",
            guid,
            info.operation_type,
            success,
            result_data.len(),
            info.started_at.elapsed()
        );
        self.send_result(guid, success, result_data);
        ops.remove(&guid);
    }

    /// Ask a running operation to stop. Returns `false` for unknown operations.
    pub fn cancel_operation(&self, guid: Uuid) -> bool {
        let ops = self.ops.lock().expect("ops lock poisoned");
        match ops.get(&guid) {
            Some(info) => {
                if info.progress.user_clicked_cancel() {
                    info!("Cancel requested for long operation {}", guid);
                }
                true
            }
            None => {
                debug!("Cancel for unknown long operation {} ignored", guid);
                false
            }
        }
    }

    /// Request cancellation of every tracked operation.
    pub fn cancel_all(&self) -> usize {
        let ops = self.ops.lock().expect("ops lock poisoned");
        for info in ops.values() {
            info.progress.user_clicked_cancel();
        }
        ops.len()
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        let ops = self.ops.lock().expect("ops lock poisoned");
        ops.iter()
            .map(|(guid, info)| ActiveOperation {
                operation_guid: *guid,
                document_guid: info.document_guid,
                operation_type: info.operation_type.clone(),
                completion: info.progress.completion(),
                cancel_requested: info.progress.has_been_canceled(),
                task_state: info.task.as_ref().map(|task| task.state()),
                task_group: info.task_group,
                running_for_ms: info.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.ops.lock().expect("ops lock poisoned").len()
    }

    /// Poll until no operation is tracked. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(TaskConfig::GROUP_WAIT_POLL_INTERVAL);
        }
        true
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    fn send_progress(&self, guid: Uuid, completion: f32) {
        let message = ProcessMessage::from(LongOpProgressMsg {
            operation_guid: guid,
            completion,
        });
        if let Err(e) = self.comm.send_message(&message) {
            warn!("Failed to send progress for {}: {}", guid, e);
        }
    }

    fn send_result(&self, guid: Uuid, success: bool, result_data: Bytes) {
        let message = ProcessMessage::from(LongOpResultMsg {
            operation_guid: guid,
            success,
            result_data,
        });
        if let Err(e) = self.comm.send_message(&message) {
            warn!("Failed to send result for {}: {}", guid, e);
        }
    }
}

impl Drop for LongOpWorkerManager {
    fn drop(&mut self) {
        let id = self
            .message_subscription
            .lock()
            .ok()
            .and_then(|mut id| id.take());
        if let Some(id) = id {
            self.comm.events().unsubscribe(id);
        }
    }
}

/// Scheduler task that runs one operation.
struct LongOpTask {
    manager: Weak<LongOpWorkerManager>,
    guid: Uuid,
    progress: Arc<Progress>,
    worker: Mutex<Option<Box<dyn LongOpWorker>>>,
}

impl TaskBody for LongOpTask {
    fn execute(&self, task: &Task) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        if task.has_been_canceled() || self.progress.has_been_canceled() {
            debug!("Long operation {} canceled before it started", self.guid);
            manager.worker_operation_finished(self.guid, false, Bytes::new());
            return;
        }

        let worker = self.worker.lock().expect("worker lock poisoned").take();
        let Some(mut worker) = worker else {
            return;
        };

        let mut writer = StreamWriter::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            worker.execute(&self.progress, &mut writer)
        }));

        let (success, data) = match outcome {
            Ok(Ok(())) => (true, writer.into_bytes()),
            Ok(Err(e)) => {
                warn!("Long operation {} failed: {}", self.guid, e);
                (false, writer.into_bytes())
            }
            Err(_) => {
                error!("Long operation {} panicked", self.guid);
                (false, Bytes::new())
            }
        };
        manager.worker_operation_finished(self.guid, success, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TaskSystemConfig, WorkerPoolConfig};

    fn tasks() -> Arc<TaskSystem> {
        Arc::new(
            TaskSystem::new(TaskSystemConfig {
                short_tasks: WorkerPoolConfig::new(1, 0),
                long_tasks: WorkerPoolConfig::new(2, 1),
                file_access: WorkerPoolConfig::new(1, 0),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_forwarder_coalesces_small_steps() {
        let forwarder = ProgressForwarder {
            min_delta: 0.1,
            last_sent: Mutex::new(None),
        };
        assert!(forwarder.should_send(0.0));
        assert!(!forwarder.should_send(0.05));
        assert!(forwarder.should_send(0.12));
        assert!(!forwarder.should_send(0.2));
        assert!(forwarder.should_send(1.0));
    }

    #[test]
    fn test_forwarder_default_sends_everything() {
        let forwarder = ProgressForwarder {
            min_delta: LongOpConfig::default().progress_min_delta,
            last_sent: Mutex::new(None),
        };
        for c in [0.0, 0.001, 0.001, 0.002] {
            assert!(forwarder.should_send(c));
        }
    }

    #[test]
    fn test_unknown_cancel_is_noop() {
        let comm = Arc::new(ProcessCommunicationChannel::new());
        let manager = LongOpWorkerManager::new(
            comm,
            tasks(),
            WorkerRegistry::new(),
            LongOpConfig::default(),
        );
        assert!(!manager.cancel_operation(Uuid::new_v4()));
        assert_eq!(manager.cancel_all(), 0);
        assert!(manager.active_operations().is_empty());
    }

    #[test]
    fn test_finished_for_unknown_operation_is_noop() {
        let manager = LongOpWorkerManager::new(
            Arc::new(ProcessCommunicationChannel::new()),
            tasks(),
            WorkerRegistry::new(),
            LongOpConfig::default(),
        );
        manager.worker_operation_finished(Uuid::new_v4(), true, Bytes::new());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_dropping_manager_unsubscribes() {
        let comm = Arc::new(ProcessCommunicationChannel::new());
        let manager = LongOpWorkerManager::new(
            Arc::clone(&comm),
            tasks(),
            WorkerRegistry::new(),
            LongOpConfig::default(),
        );
        assert_eq!(comm.events().handler_count(), 1);
        drop(manager);
        assert_eq!(comm.events().handler_count(), 0);
    }
}
