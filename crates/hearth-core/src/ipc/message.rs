//! Typed process messages and their wire envelope.
//!
//! ```text
//! [u16 LE: name len][UTF-8 type name][u8: version][body]
//! ```
//!
//! The body is written with [`StreamWriter`]. Decoders ignore trailing bytes so
//! a newer peer may append fields without breaking older readers.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stream::{StreamReader, StreamWriter};
use crate::error::HearthError;
use crate::Result;

/// Message type hierarchy used for gating and waiting.
///
/// `Any` matches every message, `LongOp` matches every long operation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Any,
    Handshake,
    Shutdown,
    LongOp,
    LongOpReplication,
    LongOpCancel,
    LongOpProgress,
    LongOpResult,
}

impl MessageKind {
    pub fn parent(self) -> Option<MessageKind> {
        match self {
            MessageKind::Any => None,
            MessageKind::Handshake | MessageKind::Shutdown | MessageKind::LongOp => {
                Some(MessageKind::Any)
            }
            MessageKind::LongOpReplication
            | MessageKind::LongOpCancel
            | MessageKind::LongOpProgress
            | MessageKind::LongOpResult => Some(MessageKind::LongOp),
        }
    }

    /// `true` if `self` equals `ancestor` or derives from it.
    pub fn is_a(self, ancestor: MessageKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// `true` if `message` is of this kind or a derived kind.
    pub fn matches(self, message: &ProcessMessage) -> bool {
        message.kind().is_a(self)
    }

    /// Type name used on the wire and in logs.
    pub fn type_name(self) -> &'static str {
        match self {
            MessageKind::Any => "ProcessMessage",
            MessageKind::Handshake => "ProcessHandshakeMsg",
            MessageKind::Shutdown => "ShutdownProcessMsg",
            MessageKind::LongOp => "LongOpMsg",
            MessageKind::LongOpReplication => "LongOpReplicationMsg",
            MessageKind::LongOpCancel => "LongOpCancelMsg",
            MessageKind::LongOpProgress => "LongOpProgressMsg",
            MessageKind::LongOpResult => "LongOpResultMsg",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Body encoding of one concrete message type.
pub trait MessageBody: Sized {
    const KIND: MessageKind;
    const VERSION: u8 = 1;

    fn encode(&self, writer: &mut StreamWriter);

    fn decode(reader: &mut StreamReader, version: u8) -> Result<Self>;
}

/// First message each side sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandshakeMsg {
    pub protocol_version: u32,
    pub process_id: u32,
    pub process_name: String,
}

impl ProcessHandshakeMsg {
    /// Handshake describing the current process.
    pub fn for_current_process(process_name: impl Into<String>) -> Self {
        Self {
            protocol_version: crate::config::IpcConfig::PROTOCOL_VERSION,
            process_id: std::process::id(),
            process_name: process_name.into(),
        }
    }
}

impl MessageBody for ProcessHandshakeMsg {
    const KIND: MessageKind = MessageKind::Handshake;

    fn encode(&self, writer: &mut StreamWriter) {
        writer.write_u32(self.protocol_version);
        writer.write_u32(self.process_id);
        writer.write_str(&self.process_name);
    }

    fn decode(reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self {
            protocol_version: reader.read_u32()?,
            process_id: reader.read_u32()?,
            process_name: reader.read_string()?,
        })
    }
}

/// Asks the receiving process to exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownProcessMsg;

impl MessageBody for ShutdownProcessMsg {
    const KIND: MessageKind = MessageKind::Shutdown;

    fn encode(&self, _writer: &mut StreamWriter) {}

    fn decode(_reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self)
    }
}

/// Starts a long operation of `replication_type` on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongOpReplicationMsg {
    pub document_guid: Uuid,
    pub operation_guid: Uuid,
    pub replication_type: String,
    pub replication_data: Bytes,
}

impl MessageBody for LongOpReplicationMsg {
    const KIND: MessageKind = MessageKind::LongOpReplication;

    fn encode(&self, writer: &mut StreamWriter) {
        writer.write_uuid(&self.document_guid);
        writer.write_uuid(&self.operation_guid);
        writer.write_str(&self.replication_type);
        writer.write_bytes(&self.replication_data);
    }

    fn decode(reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self {
            document_guid: reader.read_uuid()?,
            operation_guid: reader.read_uuid()?,
            replication_type: reader.read_string()?,
            replication_data: reader.read_bytes()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongOpCancelMsg {
    pub operation_guid: Uuid,
}

impl MessageBody for LongOpCancelMsg {
    const KIND: MessageKind = MessageKind::LongOpCancel;

    fn encode(&self, writer: &mut StreamWriter) {
        writer.write_uuid(&self.operation_guid);
    }

    fn decode(reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self {
            operation_guid: reader.read_uuid()?,
        })
    }
}

/// Completion in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongOpProgressMsg {
    pub operation_guid: Uuid,
    pub completion: f32,
}

impl MessageBody for LongOpProgressMsg {
    const KIND: MessageKind = MessageKind::LongOpProgress;

    fn encode(&self, writer: &mut StreamWriter) {
        writer.write_uuid(&self.operation_guid);
        writer.write_f32(self.completion);
    }

    fn decode(reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self {
            operation_guid: reader.read_uuid()?,
            completion: reader.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongOpResultMsg {
    pub operation_guid: Uuid,
    pub success: bool,
    pub result_data: Bytes,
}

impl MessageBody for LongOpResultMsg {
    const KIND: MessageKind = MessageKind::LongOpResult;

    fn encode(&self, writer: &mut StreamWriter) {
        writer.write_uuid(&self.operation_guid);
        writer.write_bool(self.success);
        writer.write_bytes(&self.result_data);
    }

    fn decode(reader: &mut StreamReader, _version: u8) -> Result<Self> {
        Ok(Self {
            operation_guid: reader.read_uuid()?,
            success: reader.read_bool()?,
            result_data: reader.read_bytes()?,
        })
    }
}

/// Every message the process link knows about.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessMessage {
    Handshake(ProcessHandshakeMsg),
    Shutdown(ShutdownProcessMsg),
    LongOpReplication(LongOpReplicationMsg),
    LongOpCancel(LongOpCancelMsg),
    LongOpProgress(LongOpProgressMsg),
    LongOpResult(LongOpResultMsg),
}

impl ProcessMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ProcessMessage::Handshake(_) => MessageKind::Handshake,
            ProcessMessage::Shutdown(_) => MessageKind::Shutdown,
            ProcessMessage::LongOpReplication(_) => MessageKind::LongOpReplication,
            ProcessMessage::LongOpCancel(_) => MessageKind::LongOpCancel,
            ProcessMessage::LongOpProgress(_) => MessageKind::LongOpProgress,
            ProcessMessage::LongOpResult(_) => MessageKind::LongOpResult,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    /// Operation the message refers to, for long operation messages.
    pub fn operation_guid(&self) -> Option<Uuid> {
        match self {
            ProcessMessage::LongOpReplication(m) => Some(m.operation_guid),
            ProcessMessage::LongOpCancel(m) => Some(m.operation_guid),
            ProcessMessage::LongOpProgress(m) => Some(m.operation_guid),
            ProcessMessage::LongOpResult(m) => Some(m.operation_guid),
            ProcessMessage::Handshake(_) | ProcessMessage::Shutdown(_) => None,
        }
    }

    /// Envelope and body, ready for [`Channel::send`](super::channel::Channel::send).
    pub fn encode(&self) -> Bytes {
        match self {
            ProcessMessage::Handshake(m) => encode_envelope(m),
            ProcessMessage::Shutdown(m) => encode_envelope(m),
            ProcessMessage::LongOpReplication(m) => encode_envelope(m),
            ProcessMessage::LongOpCancel(m) => encode_envelope(m),
            ProcessMessage::LongOpProgress(m) => encode_envelope(m),
            ProcessMessage::LongOpResult(m) => encode_envelope(m),
        }
    }
}

impl From<ProcessHandshakeMsg> for ProcessMessage {
    fn from(msg: ProcessHandshakeMsg) -> Self {
        ProcessMessage::Handshake(msg)
    }
}

impl From<ShutdownProcessMsg> for ProcessMessage {
    fn from(msg: ShutdownProcessMsg) -> Self {
        ProcessMessage::Shutdown(msg)
    }
}

impl From<LongOpReplicationMsg> for ProcessMessage {
    fn from(msg: LongOpReplicationMsg) -> Self {
        ProcessMessage::LongOpReplication(msg)
    }
}

impl From<LongOpCancelMsg> for ProcessMessage {
    fn from(msg: LongOpCancelMsg) -> Self {
        ProcessMessage::LongOpCancel(msg)
    }
}

impl From<LongOpProgressMsg> for ProcessMessage {
    fn from(msg: LongOpProgressMsg) -> Self {
        ProcessMessage::LongOpProgress(msg)
    }
}

impl From<LongOpResultMsg> for ProcessMessage {
    fn from(msg: LongOpResultMsg) -> Self {
        ProcessMessage::LongOpResult(msg)
    }
}

fn encode_envelope<M: MessageBody>(body: &M) -> Bytes {
    let name = M::KIND.type_name();
    let mut writer = StreamWriter::with_capacity(64);
    writer.write_u16(name.len() as u16);
    writer.write_raw(name.as_bytes());
    writer.write_u8(M::VERSION);
    body.encode(&mut writer);
    writer.into_bytes()
}

type Decoder = fn(&mut StreamReader, u8) -> Result<ProcessMessage>;

fn decoder_for<M>() -> Decoder
where
    M: MessageBody + Into<ProcessMessage>,
{
    |reader, version| M::decode(reader, version).map(Into::into)
}

/// Maps wire type names to decoders.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    decoders: HashMap<String, Decoder>,
}

impl MessageRegistry {
    /// An empty registry. Most callers want [`MessageRegistry::default`].
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `M` under its wire type name. Replaces an earlier registration.
    pub fn register<M>(&mut self)
    where
        M: MessageBody + Into<ProcessMessage>,
    {
        self.decoders
            .insert(M::KIND.type_name().to_string(), decoder_for::<M>());
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Decode one envelope.
    pub fn decode(&self, payload: Bytes) -> Result<ProcessMessage> {
        let mut reader = StreamReader::new(payload);
        let name_len = reader.read_u16()? as usize;
        let name_raw = reader.read_raw(name_len)?;
        let name = std::str::from_utf8(&name_raw)
            .map_err(|e| HearthError::decode(format!("invalid type name: {e}")))?;
        let version = reader.read_u8()?;

        let decoder = self
            .decoders
            .get(name)
            .ok_or_else(|| HearthError::UnknownMessageType(name.to_string()))?;
        decoder(&mut reader, version)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<ProcessHandshakeMsg>();
        registry.register::<ShutdownProcessMsg>();
        registry.register::<LongOpReplicationMsg>();
        registry.register::<LongOpCancelMsg>();
        registry.register::<LongOpProgressMsg>();
        registry.register::<LongOpResultMsg>();
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_hierarchy() {
        assert!(MessageKind::LongOpProgress.is_a(MessageKind::LongOp));
        assert!(MessageKind::LongOpProgress.is_a(MessageKind::Any));
        assert!(MessageKind::Handshake.is_a(MessageKind::Handshake));
        assert!(!MessageKind::Handshake.is_a(MessageKind::LongOp));
        assert!(!MessageKind::LongOp.is_a(MessageKind::LongOpResult));
    }

    #[test]
    fn test_envelope_layout() {
        let payload = ProcessMessage::from(ShutdownProcessMsg).encode();
        let name = b"ShutdownProcessMsg";

        assert_eq!(u16::from_le_bytes([payload[0], payload[1]]) as usize, name.len());
        assert_eq!(&payload[2..2 + name.len()], name);
        assert_eq!(payload[2 + name.len()], 1);
        assert_eq!(payload.len(), 2 + name.len() + 1);
    }

    #[test]
    fn test_result_message_decodes() {
        let msg = ProcessMessage::from(LongOpResultMsg {
            operation_guid: Uuid::new_v4(),
            success: true,
            result_data: Bytes::from(vec![7u8; 100]),
        });
        let decoded = MessageRegistry::default().decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let guid = Uuid::new_v4();
        let mut raw = ProcessMessage::from(LongOpCancelMsg {
            operation_guid: guid,
        })
        .encode()
        .to_vec();
        raw.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let decoded = MessageRegistry::default().decode(Bytes::from(raw)).unwrap();
        assert_eq!(decoded.operation_guid(), Some(guid));
    }

    #[test]
    fn test_unknown_type_name_is_reported() {
        let mut writer = StreamWriter::new();
        writer.write_u16(9);
        writer.write_raw(b"MysteryOp");
        writer.write_u8(1);

        let err = MessageRegistry::default()
            .decode(writer.into_bytes())
            .unwrap_err();
        assert!(matches!(err, HearthError::UnknownMessageType(name) if name == "MysteryOp"));
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        let full = ProcessMessage::from(ProcessHandshakeMsg::for_current_process("editor")).encode();
        let cut = full.slice(..full.len() - 3);
        assert!(matches!(
            MessageRegistry::default().decode(cut),
            Err(HearthError::Decode { .. })
        ));
    }
}
