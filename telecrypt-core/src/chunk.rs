//! Framer / deframer: split padded ciphertext into MTU-bounded link units, and
//! turn arriving units back into reassembly input.

use serde::{Deserialize, Serialize};

use crate::wire::{self, Frame, FrameDecodeError, FrameEncodeError, FrameHeader, HEADER_SIZE};

/// Largest unit the radio link carries in one transmission.
pub const DEFAULT_MTU: usize = 250;

/// How ciphertext is cut into link units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// Every unit carries a [`FrameHeader`]; the receiver knows when a message is complete.
    #[default]
    Headered,
    /// Bare ciphertext slices; the receiver relies on arrival order and inactivity.
    Raw,
}

impl FramingMode {
    pub fn header_size(self) -> usize {
        match self {
            FramingMode::Headered => HEADER_SIZE,
            FramingMode::Raw => 0,
        }
    }
}

impl std::str::FromStr for FramingMode {
    type Err = UnknownFraming;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headered" => Ok(FramingMode::Headered),
            "raw" => Ok(FramingMode::Raw),
            _ => Err(UnknownFraming(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown framing {0:?} (expected headered or raw)")]
pub struct UnknownFraming(pub String);

/// Ciphertext bytes that fit in one unit of `mtu` bytes.
pub fn payload_capacity(mtu: usize, mode: FramingMode) -> Result<usize, FrameEncodeError> {
    let cap = mtu.saturating_sub(mode.header_size());
    if cap == 0 {
        return Err(FrameEncodeError::MtuTooSmall { mtu });
    }
    Ok(cap.min(u16::MAX as usize))
}

/// Split ciphertext left to right into frames of at most `max_payload` bytes.
/// `max_payload == 0` uses the capacity of a [`DEFAULT_MTU`] unit.
pub fn split_into_frames(
    ciphertext: &[u8],
    max_payload: usize,
) -> Result<Vec<Frame>, FrameEncodeError> {
    let size = if max_payload == 0 {
        DEFAULT_MTU - HEADER_SIZE
    } else {
        max_payload.min(u16::MAX as usize)
    };
    let frames = ciphertext.len().div_ceil(size);
    let total = u16::try_from(frames).map_err(|_| FrameEncodeError::TooManyFrames { frames })?;
    Ok(ciphertext
        .chunks(size)
        .enumerate()
        .map(|(i, payload)| Frame {
            header: FrameHeader {
                sequence: i as u16,
                total,
                payload_len: payload.len() as u16,
            },
            payload: payload.to_vec(),
        })
        .collect())
}

/// Produce the encoded units to hand to the transport, one per link transmission.
pub fn split_units(
    ciphertext: &[u8],
    mtu: usize,
    mode: FramingMode,
) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    let cap = payload_capacity(mtu, mode)?;
    match mode {
        FramingMode::Headered => split_into_frames(ciphertext, cap)?
            .iter()
            .map(wire::encode_frame)
            .collect(),
        FramingMode::Raw => Ok(ciphertext.chunks(cap).map(<[u8]>::to_vec).collect()),
    }
}

/// One arriving unit after its header (if any) is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    Framed {
        sequence: u16,
        total: u16,
        payload: Vec<u8>,
    },
    Raw(Vec<u8>),
}

impl Arrival {
    pub fn payload(&self) -> &[u8] {
        match self {
            Arrival::Framed { payload, .. } => payload,
            Arrival::Raw(payload) => payload,
        }
    }
}

/// Strip the header from a received unit according to the configured mode.
pub fn deframe(mode: FramingMode, unit: &[u8]) -> Result<Arrival, FrameDecodeError> {
    match mode {
        FramingMode::Headered => {
            let frame = wire::decode_frame(unit)?;
            Ok(Arrival::Framed {
                sequence: frame.header.sequence,
                total: frame.header.total,
                payload: frame.payload,
            })
        }
        FramingMode::Raw => Ok(Arrival::Raw(unit.to_vec())),
    }
}
