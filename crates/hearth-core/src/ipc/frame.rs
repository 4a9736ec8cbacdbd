//! Stream framing.
//!
//! ```text
//! [u32 LE: magic "USED"][u32 LE: payload len][payload bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::IpcConfig;
use crate::error::HearthError;
use crate::Result;

/// Prefix `payload` with the frame header.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(HearthError::MessageTooLarge {
            size: payload.len(),
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(IpcConfig::FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(IpcConfig::FRAME_MAGIC);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete. A bad magic or an
/// oversized length is an error; the stream cannot be resynchronized after it.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < IpcConfig::FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..IpcConfig::FRAME_HEADER_SIZE];
    let magic = header.get_u32_le();
    let len = header.get_u32_le() as usize;

    if magic != IpcConfig::FRAME_MAGIC {
        return Err(HearthError::decode(format!(
            "bad frame magic {magic:#010x}"
        )));
    }
    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(HearthError::MessageTooLarge {
            size: len,
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    if buf.len() < IpcConfig::FRAME_HEADER_SIZE + len {
        buf.reserve(IpcConfig::FRAME_HEADER_SIZE + len - buf.len());
        return Ok(None);
    }

    buf.advance(IpcConfig::FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}
