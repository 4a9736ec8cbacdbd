//! Hearth Core - process link between the editor and the engine.
//!
//! This crate provides the pieces both processes share:
//!
//! - [`ipc`]: framed, versioned messages over a pipe or TCP channel, with a
//!   handshake gate and blocking waits
//! - [`task`]: a prioritized multi-threaded task scheduler with reserve threads
//! - [`longop`]: long operations started by one process and executed by the
//!   other, with streamed progress and cooperative cancellation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use hearth_core::ipc::{Channel, ChannelMode, MessageLoop, ProcessCommunicationChannel};
//!
//! fn main() -> hearth_core::Result<()> {
//!     let message_loop = MessageLoop::new()?;
//!     let comm = ProcessCommunicationChannel::new();
//!     comm.connect_to(Arc::new(Channel::create_pipe_channel(
//!         &message_loop,
//!         "engine",
//!         ChannelMode::Client,
//!     )))?;
//!     comm.wait_for_connection(Some(Duration::from_secs(10)))?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod ipc;
pub mod longop;
pub mod sync;
pub mod task;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{IpcConfig, LongOpConfig, TaskConfig, TaskSystemConfig, WorkerPoolConfig};
pub use error::{HearthError, Result};
pub use event::{Event, Subscription, SubscriptionId};
pub use ipc::{
    Channel, ChannelMode, MessageKind, MessageLoop, ProcessCommunicationChannel, ProcessMessage,
    TransportKind,
};
pub use longop::{
    LongOpController, LongOpState, LongOpWorker, LongOpWorkerManager, Progress, WorkerRegistry,
};
pub use sync::Signal;
pub use task::{Task, TaskGroupId, TaskPriority, TaskSystem, WorkerThreadType};
