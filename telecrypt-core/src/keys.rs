//! Key material: 256-bit shared key and 128-bit initial chaining value.
//! Both are provisioned out of band and fixed for the process lifetime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// Key length in bytes (AES-256 and the Feistel cipher both take 256-bit keys).
pub const KEY_SIZE: usize = 32;
/// Initial chaining value length in bytes.
pub const IV_SIZE: usize = 16;

/// Shared symmetric key. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Provisioning default: bytes 0x00..=0x1F.
impl Default for SymmetricKey {
    fn default() -> Self {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        SymmetricKey(key)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Initial chaining value for CBC. The engine copies it per message; it is never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitVector([u8; IV_SIZE]);

impl InitVector {
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        InitVector(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

/// Provisioning default: bytes 0x01..=0x10.
impl Default for InitVector {
    fn default() -> Self {
        let mut iv = [0u8; IV_SIZE];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        InitVector(iv)
    }
}

/// Error parsing hex key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

fn parse_fixed<const N: usize>(s: &str) -> Result<[u8; N], KeyParseError> {
    let bytes = hex::decode(s.trim())?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| KeyParseError::Length {
        expected: N,
        actual,
    })
}

impl FromStr for SymmetricKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed::<KEY_SIZE>(s).map(SymmetricKey)
    }
}

impl FromStr for InitVector {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed::<IV_SIZE>(s).map(InitVector)
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for InitVector {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
