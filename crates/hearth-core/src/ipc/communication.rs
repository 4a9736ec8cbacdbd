//! Application-facing side of the process link.
//!
//! [`ProcessCommunicationChannel`] adds three things on top of [`Protocol`]:
//!
//! - a send gate that drops every message until the first message of an
//!   allowed kind (normally the handshake) went out,
//! - blocking waits for a message kind or for the connection,
//! - a broadcast [`Event`] carrying every received message.
//!
//! Blocking waits must not run on the message loop thread: the loop is what
//! delivers the bytes being waited for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelEvent, ChannelEventKind};
use super::message::{MessageKind, ProcessMessage};
use super::message_loop::MessageLoop;
use super::protocol::Protocol;
use crate::error::HearthError;
use crate::event::Event;
use crate::sync::Signal;
use crate::Result;

/// Decides whether a matching message completes a wait. Return `true` when done.
pub type WaitCallback = Box<dyn FnMut(&ProcessMessage) -> bool + Send>;

#[derive(Default)]
struct WaitState {
    kind: Option<MessageKind>,
    callback: Option<WaitCallback>,
}

struct Shared {
    wait: Mutex<WaitState>,
    events: Event<ProcessMessage>,
}

impl Shared {
    fn dispatch(&self, message: &ProcessMessage) {
        {
            let mut wait = self.wait.lock().expect("wait lock poisoned");
            if let Some(kind) = wait.kind {
                if kind.matches(message) {
                    let done = match wait.callback.as_mut() {
                        Some(callback) => callback(message),
                        None => true,
                    };
                    if done {
                        wait.kind = None;
                        wait.callback = None;
                    }
                }
            }
        }
        self.events.broadcast(message);
    }

    fn is_waiting(&self) -> bool {
        self.wait.lock().expect("wait lock poisoned").kind.is_some()
    }
}

/// Clears the wait state on every exit path of a wait.
struct WaitGuard<'a> {
    shared: &'a Shared,
    active: &'a AtomicBool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut wait) = self.shared.wait.lock() {
            wait.kind = None;
            wait.callback = None;
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Gated, waitable message link to the peer process.
pub struct ProcessCommunicationChannel {
    protocol: Mutex<Option<Arc<Protocol>>>,
    gate: Mutex<Option<MessageKind>>,
    waiting: AtomicBool,
    shared: Arc<Shared>,
}

impl ProcessCommunicationChannel {
    pub fn new() -> Self {
        Self {
            protocol: Mutex::new(None),
            gate: Mutex::new(None),
            waiting: AtomicBool::new(false),
            shared: Arc::new(Shared {
                wait: Mutex::new(WaitState::default()),
                events: Event::new(),
            }),
        }
    }

    /// Attach `channel` and start connecting it. Replaces any earlier channel.
    pub fn connect_to(&self, channel: Arc<Channel>) -> Result<()> {
        self.disconnect();

        let protocol = Protocol::new(Arc::clone(&channel));
        let shared = Arc::clone(&self.shared);
        protocol.set_message_handler(move |message| shared.dispatch(message));

        info!(
            "Communication channel attached to {} ({:?})",
            channel.address(),
            channel.mode()
        );
        *self.protocol.lock().expect("protocol lock poisoned") = Some(Arc::new(protocol));
        channel.connect()
    }

    /// Convenience for the common pipe setup.
    pub fn connect_pipe(
        &self,
        message_loop: &MessageLoop,
        name: &str,
        mode: super::transport::ChannelMode,
    ) -> Result<Arc<Channel>> {
        let channel = Arc::new(Channel::create_pipe_channel(message_loop, name, mode));
        self.connect_to(Arc::clone(&channel))?;
        Ok(channel)
    }

    /// Detach the protocol, then tear the channel down.
    pub fn disconnect(&self) {
        let protocol = self.protocol.lock().expect("protocol lock poisoned").take();
        if let Some(protocol) = protocol {
            let channel = Arc::clone(protocol.channel());
            drop(protocol);
            channel.disconnect();
            debug!("Communication channel detached from {}", channel.address());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current_protocol()
            .is_some_and(|p| p.channel().is_connected())
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.current_protocol().map(|p| Arc::clone(p.channel()))
    }

    /// Every received message, broadcast on the thread that processes messages.
    pub fn events(&self) -> &Event<ProcessMessage> {
        &self.shared.events
    }

    /// Drop every send until a message of `kind` (or a derived kind) is sent.
    ///
    /// `None` lifts the restriction.
    pub fn set_first_allowed_message_type(&self, kind: Option<MessageKind>) {
        *self.gate.lock().expect("gate lock poisoned") = kind;
    }

    pub fn first_allowed_message_type(&self) -> Option<MessageKind> {
        *self.gate.lock().expect("gate lock poisoned")
    }

    pub fn send_message(&self, message: &ProcessMessage) -> Result<()> {
        let mut gate = self.gate.lock().expect("gate lock poisoned");
        if let Some(allowed) = *gate {
            if !allowed.matches(message) {
                warn!(
                    "Ignored send message of type {} because it is not {}",
                    message.kind(),
                    allowed
                );
                return Err(HearthError::MessageGated {
                    sent: message.kind(),
                    allowed,
                });
            }
        }

        let protocol = self.current_protocol().ok_or(HearthError::NotConnected)?;
        protocol.send(message)?;

        // The gate lock is held across the send so nothing overtakes the
        // first allowed message.
        if gate.take().is_some() {
            debug!("Send gate opened by {}", message.kind());
        }
        Ok(())
    }

    /// Dispatch queued messages. Returns `true` if any were dispatched.
    pub fn process_messages(&self) -> bool {
        self.current_protocol()
            .is_some_and(|p| p.process_messages())
    }

    /// Best-effort block for incoming traffic, then dispatch it.
    pub fn wait_for_messages(&self, timeout: Option<Duration>) -> bool {
        self.current_protocol()
            .is_some_and(|p| p.wait_for_messages(timeout))
    }

    /// Pump messages until one of `kind` arrives and `callback` (if any) accepts it.
    ///
    /// `None` waits indefinitely. Every dispatched message is still broadcast on
    /// [`events`](Self::events) while waiting.
    ///
    /// # Panics
    ///
    /// Panics if no channel is attached or another wait is already running.
    /// Debug builds also panic when called on the message loop thread.
    pub fn wait_for_message(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
        callback: Option<WaitCallback>,
    ) -> Result<()> {
        debug_assert!(
            !MessageLoop::is_loop_thread(),
            "BUG: wait_for_message({kind}) on the message loop thread"
        );
        let protocol = self.current_protocol().unwrap_or_else(|| {
            panic!("BUG: wait_for_message({kind}) without an attached channel")
        });
        assert!(
            !self.waiting.swap(true, Ordering::SeqCst),
            "BUG: wait_for_message({kind}) while another wait is active"
        );
        let _guard = WaitGuard {
            shared: &self.shared,
            active: &self.waiting,
        };
        {
            let mut wait = self.shared.wait.lock().expect("wait lock poisoned");
            wait.kind = Some(kind);
            wait.callback = callback;
        }

        let start = Instant::now();
        loop {
            if !self.shared.is_waiting() {
                return Ok(());
            }

            if !protocol.channel().is_connected() {
                // Anything that arrived before the drop still counts.
                protocol.process_messages();
                if !self.shared.is_waiting() {
                    return Ok(());
                }
                warn!("Lost connection while waiting for {}", kind);
                return Err(HearthError::ConnectionLost {
                    kind: kind.to_string(),
                });
            }

            let elapsed = start.elapsed();
            let remaining = match timeout {
                Some(timeout) if elapsed >= timeout => {
                    warn!(
                        "Reached time-out of {:?} while waiting for {}",
                        timeout, kind
                    );
                    return Err(HearthError::Timeout {
                        timeout,
                        kind: kind.to_string(),
                    });
                }
                Some(timeout) => Some(timeout - elapsed),
                None => None,
            };

            protocol.wait_for_messages(remaining);
        }
    }

    /// Block until the channel is connected.
    ///
    /// # Panics
    ///
    /// Panics if no channel is attached. Debug builds also panic when called on
    /// the message loop thread.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> Result<()> {
        debug_assert!(
            !MessageLoop::is_loop_thread(),
            "BUG: wait_for_connection on the message loop thread"
        );
        let channel = self
            .channel()
            .unwrap_or_else(|| panic!("BUG: wait_for_connection without an attached channel"));
        if channel.is_connected() {
            return Ok(());
        }

        let signal = Arc::new(Signal::new());
        let raise = Arc::clone(&signal);
        let _subscription = channel.events().subscribe_scoped(move |event: &ChannelEvent| {
            if matches!(
                event.kind,
                ChannelEventKind::Connected | ChannelEventKind::Disconnected
            ) {
                raise.raise();
            }
        });

        // The transition may have happened before the subscription existed.
        if channel.is_connected() {
            return Ok(());
        }

        let raised = signal.wait(timeout);
        if channel.is_connected() {
            Ok(())
        } else if raised {
            warn!("Lost connection while waiting for connection");
            Err(HearthError::ConnectionLost {
                kind: "connection".to_string(),
            })
        } else {
            let timeout = timeout.unwrap_or_default();
            warn!("Reached time-out of {:?} while waiting for connection", timeout);
            Err(HearthError::Timeout {
                timeout,
                kind: "connection".to_string(),
            })
        }
    }

    fn current_protocol(&self) -> Option<Arc<Protocol>> {
        self.protocol.lock().expect("protocol lock poisoned").clone()
    }
}

impl Default for ProcessCommunicationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessCommunicationChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{LongOpProgressMsg, LongOpResultMsg, ProcessHandshakeMsg};
    use crate::ipc::transport::ChannelMode;
    use bytes::Bytes;
    use uuid::Uuid;

    struct Link {
        _message_loop: MessageLoop,
        engine: ProcessCommunicationChannel,
        editor: ProcessCommunicationChannel,
    }

    fn link() -> Link {
        let message_loop = MessageLoop::new().unwrap();
        let engine = ProcessCommunicationChannel::new();
        let server = Arc::new(Channel::create_network_channel(
            &message_loop,
            "127.0.0.1:0",
            ChannelMode::Server,
        ));
        engine.connect_to(server.clone()).unwrap();

        let editor = ProcessCommunicationChannel::new();
        editor
            .connect_to(Arc::new(Channel::create_network_channel(
                &message_loop,
                server.bound_address().unwrap(),
                ChannelMode::Client,
            )))
            .unwrap();

        engine
            .wait_for_connection(Some(Duration::from_secs(5)))
            .unwrap();
        editor
            .wait_for_connection(Some(Duration::from_secs(5)))
            .unwrap();
        Link {
            _message_loop: message_loop,
            engine,
            editor,
        }
    }

    fn progress(completion: f32) -> ProcessMessage {
        LongOpProgressMsg {
            operation_guid: Uuid::nil(),
            completion,
        }
        .into()
    }

    #[test]
    fn test_gate_drops_until_allowed_kind_sent() {
        let link = link();
        link.editor
            .set_first_allowed_message_type(Some(MessageKind::Handshake));

        let err = link.editor.send_message(&progress(0.1)).unwrap_err();
        assert!(matches!(err, HearthError::MessageGated { .. }));
        assert_eq!(
            link.editor.first_allowed_message_type(),
            Some(MessageKind::Handshake)
        );

        link.editor
            .send_message(&ProcessHandshakeMsg::for_current_process("editor").into())
            .unwrap();
        assert_eq!(link.editor.first_allowed_message_type(), None);
        link.editor.send_message(&progress(0.2)).unwrap();

        // Only the handshake and the post-gate progress reach the engine.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = link
            .engine
            .events()
            .subscribe_scoped(move |m: &ProcessMessage| sink.lock().unwrap().push(m.kind()));
        link.engine
            .wait_for_message(MessageKind::LongOpProgress, Some(Duration::from_secs(5)), None)
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![MessageKind::Handshake, MessageKind::LongOpProgress]
        );
    }

    #[test]
    fn test_wait_matches_derived_kind() {
        let link = link();
        link.editor.send_message(&progress(0.5)).unwrap();
        link.engine
            .wait_for_message(MessageKind::LongOp, Some(Duration::from_secs(5)), None)
            .unwrap();
    }

    #[test]
    fn test_callback_decides_when_wait_is_done() {
        let link = link();
        for c in [0.25, 0.5, 1.0] {
            link.editor.send_message(&progress(c)).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        link.engine
            .wait_for_message(
                MessageKind::LongOpProgress,
                Some(Duration::from_secs(5)),
                Some(Box::new(move |m: &ProcessMessage| {
                    let ProcessMessage::LongOpProgress(p) = m else {
                        return false;
                    };
                    sink.lock().unwrap().push(p.completion);
                    p.completion >= 1.0
                })),
            )
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_wait_times_out_no_earlier_than_timeout() {
        let link = link();
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let err = link
            .engine
            .wait_for_message(MessageKind::LongOpResult, Some(timeout), None)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= timeout);

        // The wait state was cleared; a new wait is allowed.
        let err = link
            .engine
            .wait_for_message(MessageKind::LongOpResult, Some(Duration::ZERO), None)
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_disconnect_ends_wait() {
        let link = link();
        let editor = link.editor;
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            editor.disconnect();
            editor
        });

        let start = Instant::now();
        let err = link
            .engine
            .wait_for_message(MessageKind::LongOpResult, None, None)
            .unwrap_err();
        assert!(matches!(err, HearthError::ConnectionLost { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }

    #[test]
    fn test_result_payload_reaches_event_subscribers() {
        let link = link();
        let guid = Uuid::new_v4();
        link.editor
            .send_message(
                &LongOpResultMsg {
                    operation_guid: guid,
                    success: true,
                    result_data: Bytes::from(vec![9u8; 100]),
                }
                .into(),
            )
            .unwrap();

        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        link.engine
            .wait_for_message(
                MessageKind::LongOpResult,
                Some(Duration::from_secs(5)),
                Some(Box::new(move |m: &ProcessMessage| {
                    *sink.lock().unwrap() = Some(m.clone());
                    true
                })),
            )
            .unwrap();

        let Some(ProcessMessage::LongOpResult(result)) = captured.lock().unwrap().clone() else {
            panic!("no result captured");
        };
        assert_eq!(result.operation_guid, guid);
        assert_eq!(result.result_data.len(), 100);
    }

    #[test]
    #[should_panic(expected = "BUG: wait_for_message")]
    fn test_wait_without_channel_panics() {
        let comm = ProcessCommunicationChannel::new();
        let _ = comm.wait_for_message(MessageKind::Any, Some(Duration::ZERO), None);
    }

    #[test]
    fn test_send_without_channel_is_not_connected() {
        let comm = ProcessCommunicationChannel::new();
        assert!(matches!(
            comm.send_message(&progress(0.0)),
            Err(HearthError::NotConnected)
        ));
    }

    #[test]
    fn test_wait_for_connection_times_out() {
        let message_loop = MessageLoop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let comm = ProcessCommunicationChannel::new();
        comm.connect_pipe(
            &message_loop,
            &dir.path().join("absent.sock").display().to_string(),
            ChannelMode::Client,
        )
        .unwrap();

        let err = comm
            .wait_for_connection(Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_waits_refuse_to_run_on_loop_thread() {
        let message_loop = MessageLoop::new().unwrap();
        let comm = Arc::new(ProcessCommunicationChannel::new());
        comm.connect_to(Arc::new(Channel::create_network_channel(
            &message_loop,
            "127.0.0.1:1",
            ChannelMode::Client,
        )))
        .unwrap();

        let on_loop = Arc::clone(&comm);
        let connection = message_loop.spawn(async move {
            let _ = on_loop.wait_for_connection(Some(Duration::ZERO));
        });
        let on_loop = Arc::clone(&comm);
        let message = message_loop.spawn(async move {
            let _ = on_loop.wait_for_message(MessageKind::Any, Some(Duration::ZERO), None);
        });

        for handle in [connection, message] {
            let panic = message_loop
                .handle()
                .block_on(handle)
                .unwrap_err()
                .into_panic();
            let text = panic
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_default();
            assert!(text.starts_with("BUG:"), "unexpected panic: {text}");
            assert!(text.contains("message loop thread"));
        }
    }
}
