//! Wire format for headered frames: 6-byte big-endian header + ciphertext payload.
//!
//! ```text
//! +----------------+----------------+----------------+------------------+
//! | sequence: u16  | total: u16     | payload_len:u16| payload bytes    |
//! +----------------+----------------+----------------+------------------+
//! ```
//!
//! No authentication tag: a tampered frame decodes fine and decrypts to garbage.

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// 0-based index of this frame within the message.
    pub sequence: u16,
    /// Number of frames in the message.
    pub total: u16,
    /// Payload bytes following the header.
    pub payload_len: u16,
}

/// One frame of a message, header plus ciphertext slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

fn header_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Encode a frame: header then payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    if frame.payload.len() != frame.header.payload_len as usize {
        return Err(FrameEncodeError::LengthMismatch {
            declared: frame.header.payload_len,
            actual: frame.payload.len(),
        });
    }
    let header = header_codec()
        .serialize(&frame.header)
        .map_err(FrameEncodeError::Encode)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Error encoding a frame (bincode failure or inconsistent header).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("message needs {frames} frames, more than the header can count")]
    TooManyFrames { frames: usize },
    #[error("mtu {mtu} leaves no room for payload")]
    MtuTooSmall { mtu: usize },
}

/// Decode one link unit as a headered frame. The unit must hold exactly the header and
/// the declared payload.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::Truncated { len: bytes.len() });
    }
    let header: FrameHeader = header_codec()
        .deserialize(&bytes[..HEADER_SIZE])
        .map_err(FrameDecodeError::Decode)?;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(FrameDecodeError::LengthMismatch {
            declared: header.payload_len,
            actual: payload.len(),
        });
    }
    if header.total == 0 || header.sequence >= header.total {
        return Err(FrameDecodeError::BadSequence {
            sequence: header.sequence,
            total: header.total,
        });
    }
    Ok(Frame {
        header,
        payload: payload.to_vec(),
    })
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("unit of {len} bytes is shorter than the frame header")]
    Truncated { len: usize },
    #[error("header declares {declared} payload bytes, unit carries {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("sequence {sequence} out of range for {total} frames")]
    BadSequence { sequence: u16, total: u16 },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
