//! Detached signing and verification of commit blobs against a keyring.
//!
//! There is no asymmetric key split here: a "private key" and its matching
//! "public key record" are the same 32 bytes. A verifier trusts a signer's
//! key only because it was handed the key material out of band and stored
//! it in its keyring — the same trust model the fingerprint-lookup scheme
//! in [`crate::metadata`] implies. `pem_bytes` in a `KeyRecord` holds this
//! raw key material; the name is kept only for shape-compatibility with
//! that record type.

use blake2::digest::consts::U16;
use blake2::digest::consts::U32;
use blake2::digest::Mac as _;
use blake2::Blake2s;
use blake2::Blake2sMac;
use blake2::Digest as _;
use rand::RngCore as _;

use crate::commit::Commit;
use crate::error::OriResult;
use crate::metadata::MetadataLog;
use crate::metadata::Transaction;

const KEY_LEN: usize = 32;

type Blake2sFingerprint = Blake2s<U16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
    Untrusted,
}

/// A symmetric signing/verification key: 32 random bytes, identified by a
/// fingerprint derived from its own bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey([u8; KEY_LEN]);

impl SigningKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// `hex(blake2s256(key_bytes))` truncated to 16 hex characters, used as
    /// the lookup key in a [`MetadataLog`] keyring.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Blake2sFingerprint::new();
        hasher.update(self.0);
        hex::encode(hasher.finalize())
    }

    fn keyed_mac(&self, preimage: &[u8]) -> Vec<u8> {
        let mut mac = Blake2sMac::<U32>::new_from_slice(&self.0).expect("32-byte key is valid for Blake2s keying");
        mac.update(preimage);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({})", self.fingerprint())
    }
}

/// Signs `commit`'s without-signature preimage with `key`, attaching the
/// resulting MAC and setting the signature flag.
pub fn sign(commit: &mut Commit, key: &SigningKey) {
    let mac = key.keyed_mac(&commit.preimage());
    commit.attach_signature(mac);
}

/// Recomputes `commit`'s preimage and checks it against the signature using
/// the key registered under the signature's claimed fingerprint. Returns
/// `Untrusted` rather than an error when no such key is known.
pub fn verify(commit: &Commit, claimed_fingerprint: &str, keyring: &MetadataLog) -> Verification {
    let Some(signature) = commit.signature.as_deref() else {
        return Verification::Invalid;
    };
    let Some(key_bytes) = keyring.lookup_key(claimed_fingerprint) else {
        return Verification::Untrusted;
    };
    let Ok(key_array): Result<[u8; KEY_LEN], _> = key_bytes.try_into() else {
        return Verification::Untrusted;
    };
    let key = SigningKey::from_bytes(key_array);
    let expected = key.keyed_mac(&commit.preimage());
    if constant_time_eq(&expected, signature) {
        Verification::Valid
    } else {
        Verification::Invalid
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// A repository's set of trusted signing keys, backed by the metadata log's
/// keyring.
pub struct RepositoryKeyring;

impl RepositoryKeyring {
    /// Generates a fresh key and records it in `metadata`'s keyring under
    /// its own fingerprint, so `verify` can later find it.
    pub fn generate(metadata: &mut MetadataLog) -> OriResult<SigningKey> {
        let key = SigningKey::generate();
        let mut tx = Transaction::new();
        tx.add_key_record(key.fingerprint(), key.as_bytes().to_vec());
        metadata.commit(tx)?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashedId;

    #[test]
    fn sign_then_verify_with_known_key_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = MetadataLog::open(&dir.path().join("metadata")).unwrap();
        let key = RepositoryKeyring::generate(&mut metadata).unwrap();

        let mut commit = Commit::new(HashedId::of(b"tree"), vec![]);
        sign(&mut commit, &key);

        assert_eq!(verify(&commit, &key.fingerprint(), &metadata), Verification::Valid);
    }

    #[test]
    fn tampering_with_message_after_signing_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = MetadataLog::open(&dir.path().join("metadata")).unwrap();
        let key = RepositoryKeyring::generate(&mut metadata).unwrap();

        let mut commit = Commit::new(HashedId::of(b"tree"), vec![]);
        sign(&mut commit, &key);
        commit.message = "tampered".to_owned();

        assert_eq!(verify(&commit, &key.fingerprint(), &metadata), Verification::Invalid);
    }

    #[test]
    fn unknown_fingerprint_is_untrusted_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = MetadataLog::open(&dir.path().join("metadata")).unwrap();
        let key = SigningKey::generate();

        let mut commit = Commit::new(HashedId::of(b"tree"), vec![]);
        sign(&mut commit, &key);

        assert_eq!(verify(&commit, &key.fingerprint(), &metadata), Verification::Untrusted);
    }
}
