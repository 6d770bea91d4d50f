//! Seeded SipHash-2-4 helpers for byte-view keys.
//!
//! The dict itself never hashes anything: hashing is a [`DictType`]
//! callback. These helpers are what most key types plug into that
//! callback, namely SipHash-2-4 keyed with a 128-bit seed, so hash values
//! are not predictable by clients that can choose keys.
//!
//! [`DictType`]: crate::DictType

use std::hash::Hasher;

use rand::RngCore;
use siphasher::sip::SipHasher24;

/// A 128-bit seed for the SipHash-2-4 helpers.
///
/// The seed is injected wherever it is needed (typically stored inside a
/// [`DictType`][crate::DictType] implementation) rather than living in
/// process-wide state; create one per process at startup and share it
/// between the dicts that must agree on hash values.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HashSeed([u8; 16]);

impl HashSeed {
    /// Wraps an explicit 16-byte seed.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Draws a fresh seed from the thread-local entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw seed bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    fn keys(&self) -> (u64, u64) {
        let k0 = u64::from_le_bytes(self.0[..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(self.0[8..].try_into().unwrap());
        (k0, k1)
    }
}

impl std::fmt::Debug for HashSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed itself.
        f.write_str("HashSeed(..)")
    }
}

/// Hashes `bytes` with SipHash-2-4 keyed by `seed`.
pub fn gen_hash(seed: &HashSeed, bytes: &[u8]) -> u64 {
    let (k0, k1) = seed.keys();
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(bytes);
    hasher.finish()
}

/// Case-insensitive variant of [`gen_hash`]: ASCII bytes are lowercased
/// before hashing, so `b"Key"` and `b"key"` collide on purpose.
pub fn gen_case_hash(seed: &HashSeed, bytes: &[u8]) -> u64 {
    let (k0, k1) = seed.keys();
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    let mut buf = [0u8; 64];
    for chunk in bytes.chunks(buf.len()) {
        for (dst, src) in buf.iter_mut().zip(chunk) {
            *dst = src.to_ascii_lowercase();
        }
        hasher.write(&buf[..chunk.len()]);
    }
    hasher.finish()
}
