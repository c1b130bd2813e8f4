//! Pluggable on-disk key hash (§6 `hash-function` attribute).
//!
//! The on-disk hash must be stable across processes and builds — unlike
//! `ahash`, which is reseeded per-process and used only for transient,
//! in-memory structures (see `transaction.rs`). The default is a
//! Jenkins one-at-a-time mix seeded with the database's 64-bit
//! `hash_seed`, matching the original implementation's default variant.

/// The magic value hashed (together with the seed) to produce the
/// header's `hash_test` field (§3 invariant 4). Ground: `TDB_HASH_MAGIC`
/// in the original source.
pub const HASH_MAGIC: u64 = 0x2901_5D60_3D45_D8B8;

/// A keyed hash function over raw bytes, as exposed to embedders via
/// `Attribute::HashFn`.
pub trait KeyHasher: Send + Sync {
    fn hash(&self, data: &[u8], seed: u64) -> u64;
}

/// Default hash: Jenkins one-at-a-time, folded with the seed.
#[derive(Debug, Default, Clone, Copy)]
pub struct JenkinsHasher;

impl KeyHasher for JenkinsHasher {
    fn hash(&self, data: &[u8], seed: u64) -> u64 {
        jenkins_one_at_a_time(data, seed)
    }
}

fn jenkins_one_at_a_time(data: &[u8], seed: u64) -> u64 {
    let mut h: u64 = seed;
    for &byte in data {
        h = h.wrapping_add(byte as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h = h.wrapping_add(h << 15);
    h
}

/// Compute the header's `hash_test` value for a given seed and hash
/// function: `H(HASH_MAGIC, seed)` (§3 invariant 4).
pub fn hash_test_value(hasher: &dyn KeyHasher, seed: u64) -> u64 {
    hasher.hash(&HASH_MAGIC.to_le_bytes(), seed)
}

/// Derive further bits once a 64-bit hash has been fully consumed by
/// trie descent (depth beyond 10 levels of 6 bits each). A well
/// distributed hash makes this path vanishingly rare in practice; it
/// exists only so pathological inputs can't deadlock the trie walk.
pub fn remix(hash: u64, depth: u32) -> u64 {
    hash.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(depth % 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_seed() {
        let h = JenkinsHasher;
        assert_eq!(h.hash(b"hello", 42), h.hash(b"hello", 42));
    }

    #[test]
    fn differs_across_seeds() {
        let h = JenkinsHasher;
        assert_ne!(h.hash(b"hello", 1), h.hash(b"hello", 2));
    }
}
