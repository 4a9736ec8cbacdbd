//! Editor/engine process link.
//!
//! Layers, bottom up:
//! - [`transport`]: pipe and TCP streams
//! - [`frame`]: `USED` magic + length framing
//! - [`channel`]: connection state machine and I/O on the [`MessageLoop`]
//! - [`message`] and [`protocol`]: typed, versioned messages
//! - [`communication`]: send gate, blocking waits and message events

pub mod channel;
pub mod communication;
pub mod frame;
pub mod message;
pub mod message_loop;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use channel::{Channel, ChannelEvent, ChannelEventKind, ConnectionState};
pub use communication::{ProcessCommunicationChannel, WaitCallback};
pub use message::{
    LongOpCancelMsg, LongOpProgressMsg, LongOpReplicationMsg, LongOpResultMsg, MessageKind,
    MessageRegistry, ProcessHandshakeMsg, ProcessMessage, ShutdownProcessMsg,
};
pub use message_loop::MessageLoop;
pub use protocol::Protocol;
pub use stream::{StreamReader, StreamWriter};
pub use transport::{ChannelMode, TransportKind};
