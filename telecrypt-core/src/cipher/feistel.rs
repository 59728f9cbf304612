//! 128-bit generalized Feistel cipher with a 256-bit key.
//!
//! The block is four little-endian 32-bit words split into halves `L = (w0, w1)`
//! and `R = (w2, w3)`. Each round step computes `T = F(L, c) ^ R`, then shifts
//! `R <- L`, `L <- T`. `F` mixes one half with a round constant through the
//! rotation network and the S0/S1/S0/S1 substitution layer.
//!
//! Whitening: the first four schedule words are XORed in before the rounds,
//! the four words left in the generator after the schedule are XORed in after.

use std::fmt;

use super::tables::{ROUND_CONSTANTS, S0, S1};
use super::{Block, BlockCipher};
use crate::keys::SymmetricKey;

/// Round count. Round steps consume the constant table two entries at a time.
pub const ROUNDS: usize = 32;

const WHITENING_WORDS: usize = 4;
const SCHEDULE_LEN: usize = ROUNDS + WHITENING_WORDS;

fn f(half: [u32; 2], constant: u32) -> [u32; 2] {
    let x = half[0] ^ constant;
    let y = half[1] ^ x.rotate_right(8) ^ x.rotate_left(16) ^ x.rotate_left(24);
    let substituted = u32::from(S0[(y >> 24) as usize])
        | u32::from(S1[((y >> 16) & 0xff) as usize]) << 8
        | u32::from(S0[((y >> 8) & 0xff) as usize]) << 16
        | u32::from(S1[(y & 0xff) as usize]) << 24;
    [substituted ^ constant, y]
}

/// Subkeys derived once per key: 32 round words followed by 4 output whitening words.
#[derive(Clone, PartialEq, Eq)]
pub struct RoundKeySchedule([u32; SCHEDULE_LEN]);

impl RoundKeySchedule {
    pub fn derive(key: &SymmetricKey) -> Self {
        let bytes = key.as_bytes();
        let mut generator = [0u32; 4];
        for (i, word) in generator.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                bytes[4 * i],
                bytes[4 * i + 1],
                bytes[4 * i + 2],
                bytes[4 * i + 3],
            ]);
        }

        let mut schedule = [0u32; SCHEDULE_LEN];
        // Two F applications per iteration, two words each.
        for i in 0..ROUNDS / 4 {
            let first = f([generator[2], generator[3]], ROUND_CONSTANTS[4 * i]);
            let second = f(first, ROUND_CONSTANTS[4 * i + 2]);
            let words = [first[0], first[1], second[0], second[1]];
            schedule[4 * i..4 * i + 4].copy_from_slice(&words);

            let rotation = if i % 2 == 0 { 15 } else { 17 };
            for (g, w) in generator.iter_mut().zip(words) {
                *g ^= w.rotate_left(rotation);
            }
        }
        schedule[ROUNDS..].copy_from_slice(&generator);
        RoundKeySchedule(schedule)
    }

    pub fn round_keys(&self) -> &[u32] {
        &self.0[..ROUNDS]
    }

    pub fn whitening_keys(&self) -> &[u32] {
        &self.0[ROUNDS..]
    }
}

impl fmt::Debug for RoundKeySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoundKeySchedule(..)")
    }
}

/// Feistel cipher instance; owns its schedule.
#[derive(Clone)]
pub struct Feistel128 {
    schedule: RoundKeySchedule,
}

impl Feistel128 {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            schedule: RoundKeySchedule::derive(key),
        }
    }

    pub fn schedule(&self) -> &RoundKeySchedule {
        &self.schedule
    }
}

impl fmt::Debug for Feistel128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Feistel128(..)")
    }
}

fn load_words(block: &Block) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            block[4 * i],
            block[4 * i + 1],
            block[4 * i + 2],
            block[4 * i + 3],
        ]);
    }
    words
}

fn store_words(block: &mut Block, words: [u32; 4]) {
    for (chunk, word) in block.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

impl BlockCipher for Feistel128 {
    fn encrypt_block(&self, block: &mut Block) {
        let rk = self.schedule.round_keys();
        let wk = self.schedule.whitening_keys();
        let p = load_words(block);

        let mut l = [p[0] ^ rk[0], p[1] ^ rk[1]];
        let mut r = [p[2] ^ rk[2], p[3] ^ rk[3]];
        for i in (0..ROUNDS).step_by(2) {
            let t = f(l, ROUND_CONSTANTS[i]);
            let next = [t[0] ^ r[0], t[1] ^ r[1]];
            r = l;
            l = next;
        }

        store_words(
            block,
            [l[0] ^ wk[0], l[1] ^ wk[1], r[0] ^ wk[2], r[1] ^ wk[3]],
        );
    }

    fn decrypt_block(&self, block: &mut Block) {
        let rk = self.schedule.round_keys();
        let wk = self.schedule.whitening_keys();
        let c = load_words(block);

        let mut l = [c[0] ^ wk[0], c[1] ^ wk[1]];
        let mut r = [c[2] ^ wk[2], c[3] ^ wk[3]];
        for i in (0..ROUNDS).step_by(2).rev() {
            let t = f(r, ROUND_CONSTANTS[i]);
            let prev = [l[0] ^ t[0], l[1] ^ t[1]];
            l = r;
            r = prev;
        }

        store_words(
            block,
            [l[0] ^ rk[0], l[1] ^ rk[1], r[0] ^ rk[2], r[1] ^ rk[3]],
        );
    }
}
