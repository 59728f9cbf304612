//! Cipher engines: a single-block primitive behind [`BlockCipher`], wrapped by
//! [`Engine`] which applies a chaining mode over whole buffers.
//!
//! Two variants are configured: AES-256 with CBC chaining, and the 128-bit
//! Feistel cipher applied block by block.

mod aes256;
mod feistel;
mod tables;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::{InitVector, SymmetricKey};

pub use aes256::Aes256Block;
pub use feistel::{Feistel128, RoundKeySchedule, ROUNDS};

/// Block size in bytes for both ciphers.
pub const BLOCK_SIZE: usize = 16;

pub type Block = [u8; BLOCK_SIZE];

/// Single-block permutation.
pub trait BlockCipher: Send + Sync {
    fn encrypt_block(&self, block: &mut Block);
    fn decrypt_block(&self, block: &mut Block);
}

/// Buffer-level encryption over caller-owned memory. Implementations never
/// change their key material after construction.
pub trait CipherEngine: Send + Sync + fmt::Debug {
    fn kind(&self) -> CipherKind;

    /// Encrypt `buf` in place. `buf.len()` must be a multiple of [`BLOCK_SIZE`].
    fn encrypt(&self, buf: &mut [u8]) -> Result<(), CipherError>;

    /// Decrypt `buf` in place. `buf.len()` must be a multiple of [`BLOCK_SIZE`].
    fn decrypt(&self, buf: &mut [u8]) -> Result<(), CipherError>;
}

/// Which cipher a link runs. Both ends must agree; nothing on the wire says which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    #[default]
    Aes256Cbc,
    Feistel128,
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::Aes256Cbc => f.write_str("aes256-cbc"),
            CipherKind::Feistel128 => f.write_str("feistel128"),
        }
    }
}

impl std::str::FromStr for CipherKind {
    type Err = UnknownCipher;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes256-cbc" | "aes" => Ok(CipherKind::Aes256Cbc),
            "feistel128" | "feistel" => Ok(CipherKind::Feistel128),
            _ => Err(UnknownCipher(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown cipher {0:?} (expected aes256-cbc or feistel128)")]
pub struct UnknownCipher(pub String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("buffer length {len} is not a multiple of the {BLOCK_SIZE}-byte block size")]
    UnalignedLength { len: usize },
}

/// How consecutive blocks are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chaining {
    /// Each plaintext block is XORed with the previous ciphertext block (the IV for block 0).
    Cbc(InitVector),
    /// Blocks are independent.
    Ecb,
}

/// A block cipher plus a chaining mode.
pub struct Engine<B> {
    kind: CipherKind,
    cipher: B,
    chaining: Chaining,
}

impl<B: BlockCipher> Engine<B> {
    pub fn new(kind: CipherKind, cipher: B, chaining: Chaining) -> Self {
        Self {
            kind,
            cipher,
            chaining,
        }
    }

    pub fn chaining(&self) -> Chaining {
        self.chaining
    }
}

impl<B> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &self.kind)
            .field("chaining", &self.chaining)
            .finish_non_exhaustive()
    }
}

fn check_aligned(len: usize) -> Result<(), CipherError> {
    if len % BLOCK_SIZE != 0 {
        return Err(CipherError::UnalignedLength { len });
    }
    Ok(())
}

fn xor_into(block: &mut Block, other: &Block) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}

impl<B: BlockCipher> CipherEngine for Engine<B> {
    fn kind(&self) -> CipherKind {
        self.kind
    }

    fn encrypt(&self, buf: &mut [u8]) -> Result<(), CipherError> {
        check_aligned(buf.len())?;
        // Chain restarts from the configured IV for every message.
        let mut chain = match self.chaining {
            Chaining::Cbc(iv) => Some(*iv.as_bytes()),
            Chaining::Ecb => None,
        };
        let mut block: Block = [0u8; BLOCK_SIZE];
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            block.copy_from_slice(chunk);
            if let Some(prev) = &chain {
                xor_into(&mut block, prev);
            }
            self.cipher.encrypt_block(&mut block);
            if let Some(prev) = &mut chain {
                *prev = block;
            }
            chunk.copy_from_slice(&block);
        }
        Ok(())
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), CipherError> {
        check_aligned(buf.len())?;
        let mut chain = match self.chaining {
            Chaining::Cbc(iv) => Some(*iv.as_bytes()),
            Chaining::Ecb => None,
        };
        let mut block: Block = [0u8; BLOCK_SIZE];
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            block.copy_from_slice(chunk);
            let ciphertext = block;
            self.cipher.decrypt_block(&mut block);
            if let Some(prev) = &mut chain {
                xor_into(&mut block, prev);
                *prev = ciphertext;
            }
            chunk.copy_from_slice(&block);
        }
        Ok(())
    }
}

/// Build the engine for `kind`. AES runs in CBC from `iv`; the Feistel cipher runs
/// block by block and ignores `iv`.
pub fn build_engine(
    kind: CipherKind,
    key: &SymmetricKey,
    iv: &InitVector,
) -> Box<dyn CipherEngine> {
    match kind {
        CipherKind::Aes256Cbc => Box::new(Engine::new(
            kind,
            Aes256Block::new(key),
            Chaining::Cbc(*iv),
        )),
        CipherKind::Feistel128 => {
            Box::new(Engine::new(kind, Feistel128::new(key), Chaining::Ecb))
        }
    }
}
