//! Link parameters shared by both ends. Sender and receiver must agree on
//! cipher, framing, key and IV; the rest is local tuning.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::{self, FramingMode, DEFAULT_MTU};
use crate::cipher::{self, CipherEngine, CipherKind, BLOCK_SIZE};
use crate::keys::{InitVector, SymmetricKey};
use crate::padding;
use crate::reassembly::AllocPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Block cipher (default aes256-cbc).
    #[serde(default)]
    pub cipher: CipherKind,
    /// Unit framing (default headered).
    #[serde(default)]
    pub framing: FramingMode,
    /// 32-byte key, hex.
    #[serde(default)]
    pub key: SymmetricKey,
    /// 16-byte CBC IV, hex. Ignored by feistel128.
    #[serde(default)]
    pub iv: InitVector,
    /// Largest unit the link accepts (default 250).
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Bound on the wait for all acknowledgements (default 100 ms).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Silence after which the receiver flushes (default 100 ms).
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    /// Pause between frame submissions (default 10 ms).
    #[serde(default = "default_inter_frame_delay_ms")]
    pub inter_frame_delay_ms: u64,
    /// Largest plaintext accepted (default 16384).
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Receiver reaction when the reassembly buffer cannot grow (default restart).
    #[serde(default)]
    pub on_alloc_failure: AllocPolicy,
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}
fn default_ack_timeout_ms() -> u64 {
    100
}
fn default_inactivity_timeout_ms() -> u64 {
    100
}
fn default_inter_frame_delay_ms() -> u64 {
    10
}
fn default_max_message_len() -> usize {
    16384
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            cipher: CipherKind::default(),
            framing: FramingMode::default(),
            key: SymmetricKey::default(),
            iv: InitVector::default(),
            mtu: default_mtu(),
            ack_timeout_ms: default_ack_timeout_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            inter_frame_delay_ms: default_inter_frame_delay_ms(),
            max_message_len: default_max_message_len(),
            on_alloc_failure: AllocPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mtu {mtu} leaves no room for a {framing:?} payload")]
    MtuTooSmall { mtu: usize, framing: FramingMode },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max_message_len {0} needs more frames than a header can count")]
    MessageTooLarge(usize),
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_millis(self.inter_frame_delay_ms)
    }

    /// Largest ciphertext a receiver should ever need to hold.
    pub fn max_ciphertext_len(&self) -> usize {
        padding::padded_len(self.max_message_len, BLOCK_SIZE)
    }

    pub fn engine(&self) -> Box<dyn CipherEngine> {
        cipher::build_engine(self.cipher, &self.key, &self.iv)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cap = chunk::payload_capacity(self.mtu, self.framing).map_err(|_| {
            ConfigError::MtuTooSmall {
                mtu: self.mtu,
                framing: self.framing,
            }
        })?;
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "ack_timeout_ms",
            });
        }
        if self.inactivity_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "inactivity_timeout_ms",
            });
        }
        if self.max_message_len == 0 {
            return Err(ConfigError::Zero {
                field: "max_message_len",
            });
        }
        if self.max_ciphertext_len().div_ceil(cap) > u16::MAX as usize {
            return Err(ConfigError::MessageTooLarge(self.max_message_len));
        }
        Ok(())
    }
}
