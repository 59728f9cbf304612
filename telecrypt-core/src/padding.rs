//! Block-alignment padding.
//!
//! Each pad byte holds the pad count, as in PKCS#7, with one difference: a
//! plaintext that is already block-aligned gets **no** pad bytes. Such a
//! message cannot be told apart from a padded one on unpad if its last byte
//! happens to lie in `1..=block_size`; see [`is_ambiguous`].

/// Padded length for `len` bytes.
pub fn padded_len(len: usize, block_size: usize) -> usize {
    if block_size == 0 {
        return len;
    }
    len.div_ceil(block_size) * block_size
}

/// True when a plaintext of `len` bytes is sent without pad bytes, so the
/// receiver's unpad may strip genuine trailing bytes.
pub fn is_ambiguous(len: usize, block_size: usize) -> bool {
    block_size != 0 && len % block_size == 0
}

/// Copy `plaintext` and append `block_size - len % block_size` bytes of that value,
/// or nothing when `len` is already a multiple of `block_size`.
pub fn pad(plaintext: &[u8], block_size: usize) -> Vec<u8> {
    let target = padded_len(plaintext.len(), block_size);
    let count = target - plaintext.len();
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(plaintext);
    out.resize(target, count as u8);
    out
}

/// Strip padding. The last byte is the pad count; a count of zero, above
/// `block_size`, or above the buffer length means the buffer is returned unchanged.
pub fn unpad(padded: &[u8], block_size: usize) -> &[u8] {
    let Some(&last) = padded.last() else {
        return padded;
    };
    let count = last as usize;
    if count == 0 || count > block_size || count > padded.len() {
        return padded;
    }
    &padded[..padded.len() - count]
}
