//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking XORs every payload byte with `key[i % 4]`, so applying the same key twice restores the
//! original bytes.

/// Generates a fresh masking key for a client frame.
#[inline]
pub(crate) fn random_key() -> [u8; 4] {
    rand::random()
}

/// Masks or unmasks `buf` in place.
///
/// Whole 4-byte words are processed with a single `u32` XOR, the tail byte by byte.
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let key_word = u32::from_ne_bytes(key);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key_word;
        word.copy_from_slice(&value.to_ne_bytes());
    }

    apply_mask_bytewise(words.into_remainder(), key);
}

/// Reference implementation, also used for the unaligned tail.
#[inline]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
