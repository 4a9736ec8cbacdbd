//! Framed byte channel between two processes.
//!
//! A [`Channel`] owns one transport connection and its state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                     \________________________/
//! ```
//!
//! # Thread Safety
//!
//! `connect`, `disconnect` and `send` may be called from any thread. All I/O
//! runs as one task on the [`MessageLoop`]; the receive callback and the
//! state-change events fired by the I/O task run on the loop thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::frame::{decode_frame, encode_frame};
use super::message_loop::MessageLoop;
use super::transport::{self, BoxedStream, ChannelMode, Listener, TransportKind};
use crate::config::IpcConfig;
use crate::error::HearthError;
use crate::event::Event;
use crate::sync::Signal;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Atomic wrapper for ConnectionState.
struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEventKind {
    Connecting,
    Connected,
    Disconnected,
}

/// Raised on every connection state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub address: String,
}

type ReceiveCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// The current connection task and its stop sender.
#[derive(Default)]
struct ConnectionControl {
    /// `None` once a disconnect was requested.
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

struct ChannelShared {
    address: String,
    mode: ChannelMode,
    transport: TransportKind,
    state: AtomicConnectionState,
    control: Mutex<ConnectionControl>,
    bound_address: Mutex<Option<String>>,
    outbound: Mutex<VecDeque<Bytes>>,
    outbound_ready: Notify,
    receive_callback: Mutex<Option<ReceiveCallback>>,
    new_messages: Signal,
    events: Event<ChannelEvent>,
}

/// Bidirectional framed message channel over a pipe or TCP socket.
pub struct Channel {
    shared: Arc<ChannelShared>,
    handle: Handle,
}

impl Channel {
    /// Channel over a local pipe (Unix domain socket or Windows named pipe).
    pub fn create_pipe_channel(
        message_loop: &MessageLoop,
        name: impl Into<String>,
        mode: ChannelMode,
    ) -> Self {
        Self::new(message_loop, TransportKind::Pipe, name.into(), mode)
    }

    /// Channel over TCP. Servers may bind port 0 and read [`Channel::bound_address`].
    pub fn create_network_channel(
        message_loop: &MessageLoop,
        address: impl Into<String>,
        mode: ChannelMode,
    ) -> Self {
        Self::new(message_loop, TransportKind::Network, address.into(), mode)
    }

    pub fn new(
        message_loop: &MessageLoop,
        transport: TransportKind,
        address: String,
        mode: ChannelMode,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                address,
                mode,
                transport,
                state: AtomicConnectionState::new(ConnectionState::Disconnected),
                control: Mutex::new(ConnectionControl::default()),
                bound_address: Mutex::new(None),
                outbound: Mutex::new(VecDeque::new()),
                outbound_ready: Notify::new(),
                receive_callback: Mutex::new(None),
                new_messages: Signal::new(),
                events: Event::new(),
            }),
            handle: message_loop.handle(),
        }
    }

    /// Start connecting. Does nothing while an attempt or connection is live.
    ///
    /// A server binds its address before returning, so bind failures are
    /// reported here; accepting the peer happens on the message loop.
    ///
    /// If a disconnect is still being torn down, this blocks until the old
    /// connection is closed. Inside an async context it cannot block and
    /// returns an error instead.
    pub fn connect(&self) -> Result<()> {
        let shared = &self.shared;

        let previous = {
            let mut control = shared.control.lock().expect("channel lock poisoned");
            if control.stop.is_some() && shared.state.load() != ConnectionState::Disconnected {
                return Ok(());
            }
            control.stop = None;
            control.task.take()
        };
        if let Some(previous) = previous {
            if !previous.is_finished() {
                if Handle::try_current().is_ok() {
                    shared
                        .control
                        .lock()
                        .expect("channel lock poisoned")
                        .task = Some(previous);
                    return Err(HearthError::Other(format!(
                        "Channel {} is still disconnecting",
                        shared.address
                    )));
                }
                debug!("Waiting for the previous connection of {} to close", shared.address);
                if let Err(e) = self.handle.block_on(previous) {
                    warn!("Previous connection task of {} failed: {}", shared.address, e);
                }
            }
        }

        let mut control = shared.control.lock().expect("channel lock poisoned");
        if control.task.is_some() {
            // A concurrent connect started first.
            return Ok(());
        }
        if !shared
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(HearthError::Other(format!(
                "Channel {} is in state {:?} without a connection task",
                shared.address,
                shared.state.load()
            )));
        }
        shared.broadcast(ChannelEventKind::Connecting);

        let listener = match shared.mode {
            ChannelMode::Server => {
                let _context = self.handle.enter();
                let bound = Listener::bind(shared.transport, &shared.address)
                    .and_then(|listener| Ok((listener.local_address()?, listener)));
                match bound {
                    Ok((address, listener)) => {
                        info!("Channel listening on {} ({})", address, shared.transport);
                        *shared.bound_address.lock().expect("channel lock poisoned") =
                            Some(address);
                        Some(listener)
                    }
                    Err(e) => {
                        warn!("Failed to bind {}: {}", shared.address, e);
                        shared.state.store(ConnectionState::Disconnected);
                        shared.broadcast(ChannelEventKind::Disconnected);
                        return Err(e);
                    }
                }
            }
            ChannelMode::Client => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        control.stop = Some(stop_tx);
        control.task = Some(
            self.handle
                .spawn(Arc::clone(shared).run_connection(listener, stop_rx)),
        );
        Ok(())
    }

    /// Request teardown. The state becomes `Disconnected` asynchronously.
    pub fn disconnect(&self) {
        let stop = self
            .shared
            .control
            .lock()
            .expect("channel lock poisoned")
            .stop
            .take();
        if let Some(stop) = stop {
            debug!("Disconnect requested for {}", self.shared.address);
            let _ = stop.send(true);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Frame and queue `payload` for the writer.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(HearthError::NotConnected);
        }
        let frame = encode_frame(payload)?;
        self.shared
            .outbound
            .lock()
            .expect("channel lock poisoned")
            .push_back(frame);
        self.shared.outbound_ready.notify_one();
        Ok(())
    }

    /// Install the handler for complete inbound payloads. Runs on the loop thread.
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        *self
            .shared
            .receive_callback
            .lock()
            .expect("channel lock poisoned") = Some(Arc::new(callback));
    }

    pub fn clear_receive_callback(&self) {
        *self
            .shared
            .receive_callback
            .lock()
            .expect("channel lock poisoned") = None;
    }

    /// Block until a message arrived or the connection state changed.
    ///
    /// `None` waits indefinitely. Returns `false` on timeout.
    pub fn wait_for_messages(&self, timeout: Option<Duration>) -> bool {
        self.shared.new_messages.wait(timeout)
    }

    pub fn events(&self) -> &Event<ChannelEvent> {
        &self.shared.events
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Address the server actually listens on, once bound.
    pub fn bound_address(&self) -> Option<String> {
        self.shared
            .bound_address
            .lock()
            .expect("channel lock poisoned")
            .clone()
    }

    pub fn mode(&self) -> ChannelMode {
        self.shared.mode
    }

    pub fn transport(&self) -> TransportKind {
        self.shared.transport
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.shared.address)
            .field("mode", &self.shared.mode)
            .field("transport", &self.shared.transport)
            .field("state", &self.state())
            .finish()
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

impl ChannelShared {
    fn broadcast(&self, kind: ChannelEventKind) {
        self.new_messages.raise();
        self.events.broadcast(&ChannelEvent {
            kind,
            address: self.address.clone(),
        });
    }

    async fn run_connection(
        self: Arc<Self>,
        listener: Option<Listener>,
        mut stop: watch::Receiver<bool>,
    ) {
        let established = tokio::select! {
            _ = stopped(&mut stop) => None,
            result = self.establish(listener) => match result {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!("Channel {} failed to connect: {}", self.address, e);
                    None
                }
            },
        };

        if let Some(stream) = established {
            if self
                .state
                .transition(ConnectionState::Connecting, ConnectionState::Connected)
            {
                info!("Channel connected: {} ({})", self.address, self.transport);
                self.broadcast(ChannelEventKind::Connected);

                match self.run_io(stream, &mut stop).await {
                    Ok(()) => debug!("Channel {} closed", self.address),
                    Err(e) => warn!("Channel {} dropped: {}", self.address, e),
                }
            }
        }

        self.outbound.lock().expect("channel lock poisoned").clear();
        self.state.store(ConnectionState::Disconnected);
        info!("Channel disconnected: {}", self.address);
        self.broadcast(ChannelEventKind::Disconnected);
    }

    async fn establish(&self, listener: Option<Listener>) -> Result<BoxedStream> {
        if let Some(listener) = listener {
            return listener.accept().await;
        }
        loop {
            match transport::connect(self.transport, &self.address).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    trace!("Connect to {} not ready: {}", self.address, e);
                    tokio::time::sleep(IpcConfig::CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn run_io(&self, stream: BoxedStream, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);

        let outcome = tokio::select! {
            result = self.read_loop(reader) => result,
            result = self.write_loop(&mut writer) => result,
            _ = stopped(stop) => Ok(()),
        };

        // Frames queued before the disconnect still go out, within a bound.
        if outcome.is_ok() {
            let flush = async {
                self.write_pending(&mut writer).await?;
                writer.shutdown().await?;
                Ok::<(), HearthError>(())
            };
            if tokio::time::timeout(IpcConfig::DISCONNECT_FLUSH_TIMEOUT, flush)
                .await
                .is_err()
            {
                debug!("Channel {} flush timed out", self.address);
            }
        }
        outcome
    }

    async fn read_loop(&self, mut reader: ReadHalf<BoxedStream>) -> Result<()> {
        let mut inbound = BytesMut::with_capacity(IpcConfig::READ_BUFFER_CAPACITY);
        loop {
            let read = reader.read_buf(&mut inbound).await?;
            if read == 0 {
                return Err(HearthError::Io {
                    message: "peer closed the connection".to_string(),
                    source: None,
                });
            }
            while let Some(payload) = decode_frame(&mut inbound)? {
                self.deliver(payload);
            }
        }
    }

    async fn write_loop(&self, writer: &mut WriteHalf<BoxedStream>) -> Result<()> {
        loop {
            self.write_pending(writer).await?;
            self.outbound_ready.notified().await;
        }
    }

    async fn write_pending(&self, writer: &mut WriteHalf<BoxedStream>) -> Result<()> {
        loop {
            let next = self
                .outbound
                .lock()
                .expect("channel lock poisoned")
                .pop_front();
            match next {
                Some(frame) => writer.write_all(&frame).await?,
                None => {
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }
    }

    fn deliver(&self, payload: Bytes) {
        trace!("Channel {} received {} bytes", self.address, payload.len());
        let callback = self
            .receive_callback
            .lock()
            .expect("channel lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(payload);
        }
        self.new_messages.raise();
    }
}
