//! Length-prefixed wire format.
//!
//! Every frame is laid out as:
//!
//! ```text
//! [length:i32-LE][code:i32-LE][payload; length bytes]
//! ```
//!
//! `length` counts payload bytes only. There is no terminator, checksum or
//! version byte. This module does no buffering of its own: [`read_frame`]
//! pulls exactly one frame off any [`Read`] and [`encode`] produces one
//! contiguous buffer so a single `write_all` keeps the frame intact.

use std::io::{self, Read};

use thiserror::Error;

use crate::message::Message;

/// Size of the fixed `length` + `code` header.
pub const HEADER_LEN: usize = 8;

/// Ceiling applied to the `length` field when no other limit is configured.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Largest payload the `length` field can describe.
pub const WIRE_MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame declares negative payload length {0}")]
    NegativeLength(i32),
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },
    #[error("failed to read frame: {0}")]
    Io(#[from] io::Error),
}

/// Decoded `length` + `code` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: usize,
    pub code: i32,
}

impl Header {
    /// Validates a raw header against `max_payload_len`.
    pub fn parse(bytes: [u8; HEADER_LEN], max_payload_len: usize) -> Result<Self, FrameError> {
        let raw_len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let code = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let len = usize::try_from(raw_len).map_err(|_| FrameError::NegativeLength(raw_len))?;
        if len > max_payload_len {
            return Err(FrameError::Oversized {
                len,
                max: max_payload_len,
            });
        }

        Ok(Self { len, code })
    }
}

/// Serializes `message` into a single frame buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    encode_parts(message.code, &message.payload)
}

pub fn encode_parts(code: i32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = i32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len: payload.len(),
        max: WIRE_MAX_PAYLOAD_LEN,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while `buf` does not yet hold a complete frame, and
/// otherwise the message together with the number of bytes it consumed.
pub fn decode(buf: &[u8], max_payload_len: usize) -> Result<Option<(Message, usize)>, FrameError> {
    let Some(header_bytes) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(header_bytes);
    let header = Header::parse(raw, max_payload_len)?;

    let total = HEADER_LEN + header.len;
    let Some(payload) = buf.get(HEADER_LEN..total) else {
        return Ok(None);
    };

    Ok(Some((Message::new(header.code, payload), total)))
}

/// Reads exactly one frame from `reader`, blocking until it is complete.
///
/// `Ok(None)` means the stream ended cleanly before any header byte arrived.
/// A stream that ends part way through a frame yields
/// [`FrameError::Truncated`] and the partial frame is dropped.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<Option<Message>, FrameError> {
    let mut raw = [0u8; HEADER_LEN];
    let received = read_full(reader, &mut raw)?;
    if received == 0 {
        return Ok(None);
    }
    if received < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            received,
        });
    }

    let header = Header::parse(raw, max_payload_len)?;
    let mut payload = vec![0u8; header.len];
    let received = read_full(reader, &mut payload)?;
    if received < header.len {
        return Err(FrameError::Truncated {
            expected: header.len,
            received,
        });
    }

    Ok(Some(Message {
        code: header.code,
        payload,
    }))
}

// Like `read_exact`, but reports how far it got when the stream ends.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
