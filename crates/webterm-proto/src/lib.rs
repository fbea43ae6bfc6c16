//! Binary wire format shared by the webterm server and its clients.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! offset  size  field
//! 0       1     type     (0x01..0x06, others pass through undecoded)
//! 1       2     length   (u16, little-endian)
//! 3       len   payload
//! ```
//!
//! Decoding never interprets the payload; resize and control payloads have
//! their own helpers below. Unknown type bytes round-trip untouched so that
//! the receiving side can decide how to answer them.

use thiserror::Error;

/// Fixed size of the `[type][length]` frame header.
pub const HEADER_LEN: usize = 3;

/// Largest payload a frame can carry (the length field is a u16).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Exact length of a resize payload: two little-endian u16s.
pub const RESIZE_PAYLOAD_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    OversizedFrame(usize),
    #[error("frame shorter than the 3-byte header")]
    ShortFrame,
    #[error("frame header claims {expected} payload bytes but only {actual} are present")]
    TruncatedPayload { expected: usize, actual: usize },
    #[error("resize payload must be exactly 4 bytes (cols u16 LE, rows u16 LE)")]
    BadResize,
    #[error("control payload must carry at least one byte")]
    BadControl,
}

/// Frame discriminator. `Unknown` carries any byte outside the assigned
/// range; it encodes and decodes like the rest so peers can surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Resize,
    Control,
    Error,
    Heartbeat,
    Close,
    Unknown(u8),
}

impl FrameType {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0x01 => FrameType::Data,
            0x02 => FrameType::Resize,
            0x03 => FrameType::Control,
            0x04 => FrameType::Error,
            0x05 => FrameType::Heartbeat,
            0x06 => FrameType::Close,
            other => FrameType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            FrameType::Data => 0x01,
            FrameType::Resize => 0x02,
            FrameType::Control => 0x03,
            FrameType::Error => 0x04,
            FrameType::Heartbeat => 0x05,
            FrameType::Close => 0x06,
            FrameType::Unknown(other) => other,
        }
    }
}

/// A decoded frame. The payload is copied out of the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

/// Encode one frame. Fails only when the payload cannot fit the u16 length
/// field; any frame type is accepted.
pub fn encode(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::OversizedFrame(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(frame_type.to_wire());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame from the front of `bytes`, returning it together with
/// the number of bytes consumed (`HEADER_LEN + payload length`).
pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::ShortFrame);
    }

    let frame_type = FrameType::from_wire(bytes[0]);
    let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    if bytes.len() < HEADER_LEN + len {
        return Err(ProtocolError::TruncatedPayload {
            expected: len,
            actual: bytes.len() - HEADER_LEN,
        });
    }

    let frame = Frame {
        frame_type,
        payload: bytes[HEADER_LEN..HEADER_LEN + len].to_vec(),
    };
    Ok((frame, HEADER_LEN + len))
}

/// Encode a resize payload: `(cols, rows)` as two little-endian u16s.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; RESIZE_PAYLOAD_LEN] {
    let mut buf = [0u8; RESIZE_PAYLOAD_LEN];
    buf[0..2].copy_from_slice(&cols.to_le_bytes());
    buf[2..4].copy_from_slice(&rows.to_le_bytes());
    buf
}

/// Decode a resize payload. Dimension validation (nonzero) is the
/// consumer's business; this only checks the layout.
pub fn decode_resize(payload: &[u8]) -> Result<(u16, u16), ProtocolError> {
    if payload.len() != RESIZE_PAYLOAD_LEN {
        return Err(ProtocolError::BadResize);
    }
    let cols = u16::from_le_bytes([payload[0], payload[1]]);
    let rows = u16::from_le_bytes([payload[2], payload[3]]);
    Ok((cols, rows))
}

/// Decode a control payload: the first byte is the signal number, any
/// trailing bytes are ignored.
pub fn decode_control(payload: &[u8]) -> Result<u8, ProtocolError> {
    match payload.first() {
        Some(&signal) => Ok(signal),
        None => Err(ProtocolError::BadControl),
    }
}
