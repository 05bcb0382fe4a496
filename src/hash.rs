//! The 256-bit content identifier used throughout the object store.

use std::fmt;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use blake2::Digest as _;

use crate::error::OriError;
use crate::error::OriResult;

/// Blake2b configured for a 256-bit digest, matching [`HASH_LEN`].
type Blake2b256 = Blake2b<U32>;

/// Length in bytes of a [`HashedId`].
pub const HASH_LEN: usize = 32;

/// A 32-byte content identifier, rendered as 64 lowercase hex characters.
///
/// The all-zero value is the distinguished "empty" id used for a branch with
/// no commits yet and for the absence of a parent/graft reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashedId([u8; HASH_LEN]);

impl HashedId {
    pub const EMPTY: Self = Self([0u8; HASH_LEN]);

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> OriResult<Self> {
        if s.len() != HASH_LEN * 2 {
            return Err(OriError::corruption(format!(
                "hash hex string has length {}, expected {}",
                s.len(),
                HASH_LEN * 2
            )));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| OriError::corruption(format!("invalid hex in hash: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hashes `canonical_blob` (the uncompressed, canonical serialization of
    /// an object) to produce its content identifier.
    pub fn of(canonical_blob: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(canonical_blob);
        let digest = hasher.finalize();
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

impl fmt::Debug for HashedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedId({})", self.hex())
    }
}

impl fmt::Display for HashedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl Default for HashedId {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = HashedId::of(b"hello");
        let hex = id.hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(HashedId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn empty_is_all_zero() {
        assert!(HashedId::EMPTY.is_empty());
        assert_eq!(HashedId::EMPTY.as_bytes(), &[0u8; HASH_LEN]);
    }

    #[test]
    fn same_input_same_hash() {
        assert_eq!(HashedId::of(b"a"), HashedId::of(b"a"));
        assert_ne!(HashedId::of(b"a"), HashedId::of(b"b"));
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(HashedId::from_hex("abcd").is_err());
    }

    #[test]
    fn from_hex_rejects_bad_digits() {
        let bad = "z".repeat(64);
        assert!(HashedId::from_hex(&bad).is_err());
    }
}
