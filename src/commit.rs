//! The versioned `Commit` record: a tree pointer, up to two parents, and
//! an optional detached signature or graft provenance record.

use smallvec::smallvec;
use smallvec::SmallVec;

use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::typed_stream::Reader;
use crate::typed_stream::Writer;

/// Almost every commit has zero, one, or two parents, so the parent list
/// lives inline rather than behind a heap allocation in the common case.
pub type Parents = SmallVec<[HashedId; 2]>;

pub const COMMIT_VERSION: u32 = 1;

pub const COMMIT_FLAG_HAS_SIGNATURE: u32 = 1 << 0;
pub const COMMIT_FLAG_IS_GRAFT: u32 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftRecord {
    pub source_repo: String,
    pub source_path: String,
    pub source_commit_id: HashedId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub version: u32,
    pub flags: u32,
    pub tree: HashedId,
    pub parents: Parents,
    pub user: String,
    pub time: u64,
    pub snapshot_name: String,
    pub graft: Option<GraftRecord>,
    pub signature: Option<Vec<u8>>,
    pub message: String,
}

impl Commit {
    pub fn new(tree: HashedId, parents: impl Into<Parents>) -> Self {
        let parents = parents.into();
        assert!(parents.len() <= 2, "a commit has at most two parents");
        Self {
            version: COMMIT_VERSION,
            flags: 0,
            tree,
            parents,
            user: String::new(),
            time: 0,
            snapshot_name: String::new(),
            graft: None,
            signature: None,
            message: String::new(),
        }
    }

    pub fn has_signature(&self) -> bool {
        self.flags & COMMIT_FLAG_HAS_SIGNATURE != 0
    }

    pub fn is_graft(&self) -> bool {
        self.flags & COMMIT_FLAG_IS_GRAFT != 0
    }

    pub fn set_graft(&mut self, record: GraftRecord) {
        self.flags |= COMMIT_FLAG_IS_GRAFT;
        self.graft = Some(record);
    }

    /// Attaches a detached signature produced over [`Self::preimage`].
    pub fn attach_signature(&mut self, signature: Vec<u8>) {
        self.flags |= COMMIT_FLAG_HAS_SIGNATURE;
        self.signature = Some(signature);
    }

    /// The canonical blob with the signature stripped: what is hashed to
    /// produce the commit's id, and what `sign`/`verify` operate over.
    pub fn preimage(&self) -> Vec<u8> {
        self.to_blob(false)
    }

    /// The id this commit would have once serialized, excluding any
    /// signature from the preimage as required.
    pub fn id(&self) -> HashedId {
        HashedId::of(&self.preimage())
    }

    pub fn to_blob(&self, with_signature: bool) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.version);
        let flags = if with_signature {
            self.flags
        } else {
            self.flags & !COMMIT_FLAG_HAS_SIGNATURE
        };
        w.write_u32(flags);
        w.write_hash(&self.tree);

        w.write_u8(self.parents.len() as u8);
        for parent in &self.parents {
            w.write_hash(parent);
        }

        w.write_pstr(&self.user);
        w.write_u64(self.time);
        w.write_pstr(&self.snapshot_name);

        if self.flags & COMMIT_FLAG_IS_GRAFT != 0 {
            let graft = self.graft.as_ref().expect("is_graft flag set without a graft record");
            w.write_pstr(&graft.source_repo);
            w.write_pstr(&graft.source_path);
            w.write_hash(&graft.source_commit_id);
        }

        if with_signature && self.flags & COMMIT_FLAG_HAS_SIGNATURE != 0 {
            let sig = self.signature.as_deref().unwrap_or_default();
            w.write_lpstr(sig);
        }

        w.write_pstr(&self.message);
        w.into_bytes()
    }

    pub fn from_blob(bytes: &[u8]) -> OriResult<Self> {
        let mut r = Reader::new(bytes);
        let version = r.read_u32()?;
        if version > COMMIT_VERSION {
            return Err(OriError::Unsupported {
                found: version,
                expected: COMMIT_VERSION,
            });
        }
        let flags = r.read_u32()?;
        let tree = r.read_hash()?;

        let nparents = r.read_u8()?;
        let mut parents: Parents = smallvec![];
        for _ in 0..nparents {
            parents.push(r.read_hash()?);
        }

        let user = r.read_pstr()?;
        let time = r.read_u64()?;
        let snapshot_name = r.read_pstr()?;

        let graft = if flags & COMMIT_FLAG_IS_GRAFT != 0 {
            let source_repo = r.read_pstr()?;
            let source_path = r.read_pstr()?;
            let source_commit_id = r.read_hash()?;
            Some(GraftRecord {
                source_repo,
                source_path,
                source_commit_id,
            })
        } else {
            None
        };

        let signature = if flags & COMMIT_FLAG_HAS_SIGNATURE != 0 {
            Some(r.read_lpstr()?)
        } else {
            None
        };

        let message = r.read_pstr()?;

        Ok(Self {
            version,
            flags,
            tree,
            parents,
            user,
            time,
            snapshot_name,
            graft,
            signature,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_without_signature() {
        let mut c = Commit::new(HashedId::of(b"tree"), vec![HashedId::of(b"parent")]);
        c.user = "alice".to_owned();
        c.time = 12345;
        c.message = "initial commit".to_owned();
        let blob = c.to_blob(true);
        let back = Commit::from_blob(&blob).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn round_trips_with_signature() {
        let mut c = Commit::new(HashedId::of(b"tree"), vec![]);
        c.attach_signature(vec![9, 9, 9]);
        let blob = c.to_blob(true);
        let back = Commit::from_blob(&blob).unwrap();
        assert_eq!(back.signature.as_deref(), Some(&[9u8, 9, 9][..]));
    }

    #[test]
    fn hash_excludes_signature() {
        let mut c = Commit::new(HashedId::of(b"tree"), vec![]);
        let id_before = c.id();
        c.attach_signature(vec![1, 2, 3]);
        assert_eq!(c.id(), id_before, "signing must not change the commit id");
    }

    #[test]
    fn round_trips_graft_record() {
        let mut c = Commit::new(HashedId::of(b"tree"), vec![]);
        c.set_graft(GraftRecord {
            source_repo: "repo-a".to_owned(),
            source_path: "/vendor".to_owned(),
            source_commit_id: HashedId::of(b"source-commit"),
        });
        let blob = c.to_blob(true);
        let back = Commit::from_blob(&blob).unwrap();
        assert_eq!(back.graft, c.graft);
    }

    #[test]
    fn rejects_future_version() {
        let mut w = Writer::new();
        w.write_u32(COMMIT_VERSION + 1);
        let bytes = w.into_bytes();
        assert!(matches!(Commit::from_blob(&bytes), Err(OriError::Unsupported { .. })));
    }
}
