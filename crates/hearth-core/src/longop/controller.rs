//! Requesting side of long operations.
//!
//! The controller starts operations in the peer process, follows their
//! progress from the message stream and exposes the final result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HearthError;
use crate::event::{Event, SubscriptionId};
use crate::ipc::communication::ProcessCommunicationChannel;
use crate::ipc::message::{
    LongOpCancelMsg, LongOpReplicationMsg, MessageKind, ProcessMessage,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LongOpState {
    Running {
        completion: f32,
    },
    Succeeded {
        #[serde(skip)]
        result: Bytes,
    },
    Failed,
}

impl LongOpState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, LongOpState::Running { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_guid: Uuid,
    pub document_guid: Uuid,
    pub operation_type: String,
    pub state: LongOpState,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LongOpEvent {
    Progress { operation_guid: Uuid, completion: f32 },
    Finished { operation_guid: Uuid, success: bool },
}

type Records = Arc<Mutex<HashMap<Uuid, OperationRecord>>>;

pub struct LongOpController {
    comm: Arc<ProcessCommunicationChannel>,
    records: Records,
    events: Arc<Event<LongOpEvent>>,
    subscription: SubscriptionId,
}

impl LongOpController {
    pub fn new(comm: Arc<ProcessCommunicationChannel>) -> Self {
        let records: Records = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(Event::new());

        let table = Arc::clone(&records);
        let broadcast = Arc::clone(&events);
        let subscription = comm.events().subscribe(move |message: &ProcessMessage| {
            if let Some(event) = apply_message(&table, message) {
                broadcast.broadcast(&event);
            }
        });

        Self {
            comm,
            records,
            events,
            subscription,
        }
    }

    /// Ask the peer to run `operation_type`. Returns the new operation's id.
    pub fn start_operation(
        &self,
        document_guid: Uuid,
        operation_type: impl Into<String>,
        config: Bytes,
    ) -> Result<Uuid> {
        let operation_guid = Uuid::new_v4();
        let operation_type = operation_type.into();

        // Tracked before sending so a fast result always finds its record.
        self.lock().insert(
            operation_guid,
            OperationRecord {
                operation_guid,
                document_guid,
                operation_type: operation_type.clone(),
                state: LongOpState::Running { completion: 0.0 },
                cancel_requested: false,
            },
        );

        let message = ProcessMessage::from(LongOpReplicationMsg {
            document_guid,
            operation_guid,
            replication_type: operation_type.clone(),
            replication_data: config,
        });
        if let Err(e) = self.comm.send_message(&message) {
            self.lock().remove(&operation_guid);
            return Err(e);
        }

        info!("Started long operation {} ('{}')", operation_guid, operation_type);
        Ok(operation_guid)
    }

    /// Request cooperative cancellation. Finished operations are left alone.
    pub fn cancel_operation(&self, operation_guid: Uuid) -> Result<()> {
        {
            let records = self.lock();
            match records.get(&operation_guid) {
                None => {
                    return Err(HearthError::Other(format!(
                        "Unknown long operation {operation_guid}"
                    )))
                }
                Some(record) if record.state.is_finished() => return Ok(()),
                Some(_) => {}
            }
        }

        self.comm
            .send_message(&LongOpCancelMsg { operation_guid }.into())?;
        if let Some(record) = self.lock().get_mut(&operation_guid) {
            record.cancel_requested = true;
        }
        debug!("Cancel sent for long operation {}", operation_guid);
        Ok(())
    }

    pub fn operation(&self, operation_guid: Uuid) -> Option<OperationRecord> {
        self.lock().get(&operation_guid).cloned()
    }

    pub fn operations(&self) -> Vec<OperationRecord> {
        self.lock().values().cloned().collect()
    }

    /// Drop the records of finished operations. Returns how many were removed.
    pub fn forget_finished(&self) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| !record.state.is_finished());
        before - records.len()
    }

    /// Pump the channel until the result of `operation_guid` arrived.
    ///
    /// Must not be called on the message loop thread.
    pub fn wait_for_result(
        &self,
        operation_guid: Uuid,
        timeout: Option<Duration>,
    ) -> Result<LongOpState> {
        match self.operation(operation_guid) {
            None => {
                return Err(HearthError::Other(format!(
                    "Unknown long operation {operation_guid}"
                )))
            }
            Some(record) if record.state.is_finished() => return Ok(record.state),
            Some(_) => {}
        }

        let waited = self.comm.wait_for_message(
            MessageKind::LongOpResult,
            timeout,
            Some(Box::new(move |message: &ProcessMessage| {
                message.operation_guid() == Some(operation_guid)
            })),
        );

        // Another thread may have pumped the result while this one waited.
        match self.operation(operation_guid) {
            Some(record) if record.state.is_finished() => Ok(record.state),
            _ => match waited {
                Ok(()) => Err(HearthError::Other(format!(
                    "Long operation {operation_guid} is no longer tracked"
                ))),
                Err(e) => Err(e),
            },
        }
    }

    pub fn events(&self) -> &Event<LongOpEvent> {
        &self.events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, OperationRecord>> {
        self.records.lock().expect("long operation records lock poisoned")
    }
}

impl Drop for LongOpController {
    fn drop(&mut self) {
        self.comm.events().unsubscribe(self.subscription);
    }
}

fn apply_message(records: &Records, message: &ProcessMessage) -> Option<LongOpEvent> {
    let mut records = records.lock().expect("long operation records lock poisoned");
    match message {
        ProcessMessage::LongOpProgress(progress) => {
            let record = records.get_mut(&progress.operation_guid)?;
            match &mut record.state {
                LongOpState::Running { completion } => {
                    *completion = progress.completion;
                    Some(LongOpEvent::Progress {
                        operation_guid: progress.operation_guid,
                        completion: progress.completion,
                    })
                }
                _ => None,
            }
        }
        ProcessMessage::LongOpResult(result) => {
            let Some(record) = records.get_mut(&result.operation_guid) else {
                warn!("Result for unknown long operation {}", result.operation_guid);
                return None;
            };
            record.state = if result.success {
                LongOpState::Succeeded {
                    result: result.result_data.clone(),
                }
            } else {
                LongOpState::Failed
            };
            info!(
                "Long operation {} finished: success={}",
                result.operation_guid, result.success
            );
            Some(LongOpEvent::Finished {
                operation_guid: result.operation_guid,
                success: result.success,
            })
        }
        _ => None,
    }
}
