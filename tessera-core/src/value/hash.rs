//! Content hashes.

use std::fmt;

/// A 32-byte BLAKE3 digest of a value's semantic payload.
///
/// Used both as the per-input fingerprint and as the validity hash that keys
/// the content cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a byte buffer.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(bytes.as_ref()).into())
    }

    /// Start an incremental hash.
    pub fn builder(domain: &str) -> ContentHasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(&[0]);
        ContentHasher(hasher)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 12 hex characters, for logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental builder for a [`ContentHash`].
///
/// Every write is length-prefixed so that adjacent fields cannot be
/// re-split into a colliding sequence.
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.0.update(&value.to_le_bytes());
        self
    }

    /// Floats are hashed by bit pattern after folding `-0.0` into `0.0`
    /// and every NaN into one canonical NaN.
    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.u64(canonical_f64(value).to_bits())
    }

    pub fn hash(&mut self, value: ContentHash) -> &mut Self {
        self.0.update(&value.0);
        self
    }

    pub fn finish(&self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

pub(crate) fn canonical_f64(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else if value.is_nan() {
        f64::NAN
    } else {
        value
    }
}
