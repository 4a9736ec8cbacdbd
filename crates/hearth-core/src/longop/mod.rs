//! Long-running, cancellable, progress-reporting operations run by one
//! process on behalf of the other.
//!
//! The engine hosts a [`LongOpWorkerManager`]; the editor drives it through a
//! [`LongOpController`]. Both sides talk over a
//! [`ProcessCommunicationChannel`](crate::ipc::ProcessCommunicationChannel).

mod controller;
mod manager;
mod progress;
mod worker;

pub use controller::{LongOpController, LongOpEvent, LongOpState, OperationRecord};
pub use manager::{ActiveOperation, LongOpWorkerManager};
pub use progress::{Progress, ProgressEvent};
pub use worker::{LongOpWorker, WorkerRegistry};
