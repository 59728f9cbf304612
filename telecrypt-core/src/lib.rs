//! Telecrypt: encrypted telemetry over a small-MTU, acknowledged radio link.
//! Host-driven: the host supplies the link ([`Transport`] plus callback
//! handles) and storage; the core does padding, encryption, framing,
//! delivery tracking and reassembly.

pub mod chunk;
pub mod cipher;
pub mod config;
pub mod delivery;
pub mod keys;
pub mod padding;
pub mod reassembly;
pub mod receiver;
pub mod sender;
pub mod storage;
pub mod transport;
pub mod wire;

pub use chunk::{FramingMode, UnknownFraming, DEFAULT_MTU};
pub use cipher::{build_engine, CipherEngine, CipherError, CipherKind, BLOCK_SIZE};
pub use config::{ConfigError, LinkConfig};
pub use delivery::{DeliveryState, DeliveryTracker, FailureReason};
pub use keys::{InitVector, SymmetricKey};
pub use reassembly::{AllocPolicy, ReassemblyError};
pub use receiver::{FlushReport, FlushTrigger, ReceiveError, Receiver};
pub use sender::{SendError, SendReport, Sender};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use transport::{
    delivery_channel, AckHandle, Delivery, DeliveryHandle, LinkAddr, SendStatus, Transport,
    TransportRejected,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
