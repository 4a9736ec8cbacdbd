//! Typed messages on top of a [`Channel`].
//!
//! Inbound payloads are queued by the channel's receive callback on the
//! message loop thread, then decoded and dispatched on whichever thread calls
//! [`Protocol::process_messages`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{trace, warn};

use super::channel::Channel;
use super::message::{MessageRegistry, ProcessMessage};
use crate::error::HearthError;
use crate::Result;

type MessageHandler = Arc<dyn Fn(&ProcessMessage) + Send + Sync>;

pub struct Protocol {
    channel: Arc<Channel>,
    registry: MessageRegistry,
    inbox: Arc<Mutex<VecDeque<Bytes>>>,
    handler: Mutex<Option<MessageHandler>>,
}

impl Protocol {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self::with_registry(channel, MessageRegistry::default())
    }

    /// Takes over the channel's receive callback.
    pub fn with_registry(channel: Arc<Channel>, registry: MessageRegistry) -> Self {
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        let queue = Arc::clone(&inbox);
        channel.set_receive_callback(move |payload| {
            queue
                .lock()
                .expect("protocol inbox lock poisoned")
                .push_back(payload);
        });

        Self {
            channel,
            registry,
            inbox,
            handler: Mutex::new(None),
        }
    }

    /// Handler for every decoded message. Runs on the thread that processes messages.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&ProcessMessage) + Send + Sync + 'static,
    {
        *self.handler.lock().expect("protocol lock poisoned") = Some(Arc::new(handler));
    }

    pub fn send(&self, message: &ProcessMessage) -> Result<()> {
        let payload = message.encode();
        trace!("Sending {} ({} bytes)", message.type_name(), payload.len());
        self.channel.send(&payload)
    }

    /// Decode and dispatch every queued payload. Returns `true` if any message
    /// reached the handler.
    pub fn process_messages(&self) -> bool {
        let pending: Vec<Bytes> = self
            .inbox
            .lock()
            .expect("protocol inbox lock poisoned")
            .drain(..)
            .collect();
        if pending.is_empty() {
            return false;
        }

        let handler = self.handler.lock().expect("protocol lock poisoned").clone();
        let mut dispatched = false;

        for payload in pending {
            match self.registry.decode(payload) {
                Ok(message) => {
                    trace!("Dispatching {}", message.type_name());
                    if let Some(handler) = &handler {
                        handler(&message);
                    }
                    dispatched = true;
                }
                Err(HearthError::UnknownMessageType(name)) => {
                    warn!("Discarding message of unknown type {}", name);
                }
                Err(e) => {
                    warn!("Discarding malformed message: {}", e);
                }
            }
        }
        dispatched
    }

    /// Process queued messages, or block until the channel signals and process then.
    pub fn wait_for_messages(&self, timeout: Option<Duration>) -> bool {
        if self.process_messages() {
            return true;
        }
        self.channel.wait_for_messages(timeout) && self.process_messages()
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox.lock().expect("protocol inbox lock poisoned").len()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.channel.clear_receive_callback();
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("channel", &self.channel)
            .field("pending", &self.pending_messages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{LongOpProgressMsg, ShutdownProcessMsg};
    use crate::ipc::message_loop::MessageLoop;
    use crate::ipc::stream::StreamWriter;
    use crate::ipc::transport::ChannelMode;
    use std::time::Instant;
    use uuid::Uuid;

    fn linked(message_loop: &MessageLoop) -> (Protocol, Protocol) {
        let server = Arc::new(Channel::create_network_channel(
            message_loop,
            "127.0.0.1:0",
            ChannelMode::Server,
        ));
        server.connect().unwrap();
        let client = Arc::new(Channel::create_network_channel(
            message_loop,
            server.bound_address().unwrap(),
            ChannelMode::Client,
        ));
        client.connect().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !(server.is_connected() && client.is_connected()) {
            assert!(Instant::now() < deadline, "channels never connected");
            std::thread::sleep(Duration::from_millis(5));
        }
        (Protocol::new(server), Protocol::new(client))
    }

    fn collect(protocol: &Protocol) -> Arc<Mutex<Vec<ProcessMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        protocol.set_message_handler(move |m| sink.lock().unwrap().push(m.clone()));
        seen
    }

    #[test]
    fn test_typed_messages_arrive() {
        let message_loop = MessageLoop::new().unwrap();
        let (engine, editor) = linked(&message_loop);
        let seen = collect(&engine);

        let progress = ProcessMessage::from(LongOpProgressMsg {
            operation_guid: Uuid::new_v4(),
            completion: 0.5,
        });
        editor.send(&progress).unwrap();
        editor.send(&ShutdownProcessMsg.into()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
            engine.wait_for_messages(Some(Duration::from_millis(50)));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], progress);
        assert_eq!(seen[1], ProcessMessage::Shutdown(ShutdownProcessMsg));
    }

    #[test]
    fn test_unknown_type_is_discarded() {
        let message_loop = MessageLoop::new().unwrap();
        let (engine, editor) = linked(&message_loop);
        let seen = collect(&engine);

        let mut unknown = StreamWriter::new();
        unknown.write_u16(11);
        unknown.write_raw(b"FancyNewMsg");
        unknown.write_u8(1);
        editor.channel().send(&unknown.into_bytes()).unwrap();
        editor.send(&ShutdownProcessMsg.into()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            engine.wait_for_messages(Some(Duration::from_millis(50)));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].type_name(), "ShutdownProcessMsg");
    }

    #[test]
    fn test_wait_times_out_without_traffic() {
        let message_loop = MessageLoop::new().unwrap();
        let (engine, _editor) = linked(&message_loop);
        engine.process_messages();
        engine.channel().wait_for_messages(Some(Duration::ZERO));

        let start = Instant::now();
        assert!(!engine.wait_for_messages(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
