//! Keyed content hashing.
//!
//! Blocks are hashed with a keyed BLAKE3 instance so that an attacker who
//! can write to a data disk cannot forge a matching hash without the key.
//! The key material folds a long-term key with a per-array seed, the same
//! two-input combination the teacher's `crypto::derive_key` performs for a
//! password and salt.

/// Width in bytes of a stored block hash. Deliberately narrower than
/// BLAKE3's native 32-byte output: metadata size matters more than
/// cryptographic margin for a corruption detector, not a signature scheme.
pub const HASH_SIZE: usize = 16;

/// Sentinel stored in place of a real hash when the value isn't comparable
/// (e.g. computed under a key that has since been rotated out).
pub const INVALID_HASH: [u8; HASH_SIZE] = [0xFF; HASH_SIZE];

pub type Digest = [u8; HASH_SIZE];

/// Selects which of the two configured key/seed pairs to hash with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKey {
    Current,
    Previous,
}

/// A keyed hasher bound to one array's current and previous key material.
pub struct Hasher {
    current_key: [u8; 32],
    previous_key: [u8; 32],
}

impl Hasher {
    pub fn new(key: &[u8], seed: &[u8], prev_key: &[u8], prev_seed: &[u8]) -> Self {
        Hasher {
            current_key: fold_key(key, seed),
            previous_key: fold_key(prev_key, prev_seed),
        }
    }

    /// Hash `data` under the selected key, truncating BLAKE3's 32-byte
    /// output down to [`HASH_SIZE`].
    pub fn hash(&self, which: HashKey, data: &[u8]) -> Digest {
        let key = match which {
            HashKey::Current => &self.current_key,
            HashKey::Previous => &self.previous_key,
        };
        let full = blake3::keyed_hash(key, data);
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&full.as_bytes()[..HASH_SIZE]);
        out
    }
}

/// Combine a long-term key and a per-array seed into one 32-byte BLAKE3 key,
/// mirroring `crypto::derive_key(password, salt)`'s two-input-to-one-key
/// shape but without Argon2's deliberate slowness — hashing happens once
/// per run, not once per guess.
fn fold_key(key: &[u8], seed: &[u8]) -> [u8; 32] {
    let mut combined = Vec::with_capacity(key.len() + seed.len());
    combined.extend_from_slice(key);
    combined.extend_from_slice(seed);
    *blake3::hash(&combined).as_bytes()
}

/// True if `digest` is the all-zero placeholder stored for a block that has
/// never been hashed (a fresh `BLK` slot before its first sync).
pub fn hash_is_zero(digest: &Digest) -> bool {
    digest.iter().all(|&b| b == 0)
}

/// True if `digest` is neither zero nor the invalid sentinel, i.e. it is
/// eligible for an equality comparison.
pub fn hash_is_real(digest: &Digest) -> bool {
    !hash_is_zero(digest) && *digest != INVALID_HASH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_data_matches() {
        let h = Hasher::new(b"key", b"seed", b"prevkey", b"prevseed");
        let a = h.hash(HashKey::Current, b"hello world");
        let b = h.hash(HashKey::Current, b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_key_differs() {
        let h1 = Hasher::new(b"key-a", b"seed", b"", b"");
        let h2 = Hasher::new(b"key-b", b"seed", b"", b"");
        assert_ne!(
            h1.hash(HashKey::Current, b"data"),
            h2.hash(HashKey::Current, b"data")
        );
    }

    #[test]
    fn current_and_previous_are_independent() {
        let h = Hasher::new(b"key", b"seed", b"otherkey", b"otherseed");
        assert_ne!(
            h.hash(HashKey::Current, b"data"),
            h.hash(HashKey::Previous, b"data")
        );
    }

    #[test]
    fn zero_and_invalid_sentinels() {
        let zero = [0u8; HASH_SIZE];
        assert!(hash_is_zero(&zero));
        assert!(!hash_is_real(&zero));
        assert!(!hash_is_real(&INVALID_HASH));
    }
}
