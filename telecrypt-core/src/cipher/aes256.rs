//! AES-256 single-block permutation (RustCrypto `aes`).

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

use super::{Block, BlockCipher};
use crate::keys::SymmetricKey;

/// Expanded AES-256 key. Chaining is applied by [`super::Engine`].
#[derive(Clone)]
pub struct Aes256Block {
    inner: aes::Aes256,
}

impl Aes256Block {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            inner: aes::Aes256::new(GenericArray::from_slice(key.as_bytes())),
        }
    }
}

impl BlockCipher for Aes256Block {
    fn encrypt_block(&self, block: &mut Block) {
        self.inner
            .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }

    fn decrypt_block(&self, block: &mut Block) {
        self.inner
            .decrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }
}

impl fmt::Debug for Aes256Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Aes256Block(..)")
    }
}
