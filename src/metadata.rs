//! The append-only log of reference-count deltas, commit status notes, and
//! trusted signing keys.
//!
//! Every record carries an explicit trailing checksum so a torn write is
//! detected precisely at the record it clipped, rather than only at EOF —
//! this is the concrete scheme chosen for the checksum framing the source
//! left implicit.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use blake2::digest::consts::U8;
use blake2::Blake2s;
use blake2::Digest as _;
use tempfile::NamedTempFile;

use crate::error::IoResultExt as _;
use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::typed_stream::Reader;
use crate::typed_stream::Writer;

type Blake2sChecksum = Blake2s<U8>;

const TAG_REF_DELTA: u8 = 1;
const TAG_COMMIT_STATUS: u8 = 2;
const TAG_KEY_RECORD: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEntry {
    RefDelta { id: HashedId, delta: i32 },
    CommitStatus { commit_id: HashedId, status: String },
    KeyRecord { fingerprint: String, pem_bytes: Vec<u8> },
}

impl MetadataEntry {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::RefDelta { id, delta } => {
                w.write_u8(TAG_REF_DELTA);
                w.write_hash(id);
                w.write_u32(*delta as u32);
            }
            Self::CommitStatus { commit_id, status } => {
                w.write_u8(TAG_COMMIT_STATUS);
                w.write_hash(commit_id);
                w.write_pstr(status);
            }
            Self::KeyRecord {
                fingerprint,
                pem_bytes,
            } => {
                w.write_u8(TAG_KEY_RECORD);
                w.write_pstr(fingerprint);
                w.write_lpstr(pem_bytes);
            }
        }
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> OriResult<Self> {
        let mut r = Reader::new(bytes);
        match r.read_u8()? {
            TAG_REF_DELTA => {
                let id = r.read_hash()?;
                let delta = r.read_u32()? as i32;
                Ok(Self::RefDelta { id, delta })
            }
            TAG_COMMIT_STATUS => {
                let commit_id = r.read_hash()?;
                let status = r.read_pstr()?;
                Ok(Self::CommitStatus { commit_id, status })
            }
            TAG_KEY_RECORD => {
                let fingerprint = r.read_pstr()?;
                let pem_bytes = r.read_lpstr()?;
                Ok(Self::KeyRecord {
                    fingerprint,
                    pem_bytes,
                })
            }
            other => Err(OriError::corruption(format!(
                "unknown metadata entry tag {other}"
            ))),
        }
    }
}

fn checksum(len_bytes: &[u8; 4], payload: &[u8]) -> u64 {
    let mut hasher = Blake2sChecksum::new();
    hasher.update(len_bytes);
    hasher.update(payload);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.into())
}

fn write_record(out: &mut impl std::io::Write, entry: &MetadataEntry) -> std::io::Result<()> {
    let payload = entry.encode();
    let len_bytes = (payload.len() as u32).to_le_bytes();
    let sum = checksum(&len_bytes, &payload);
    out.write_all(&len_bytes)?;
    out.write_all(&payload)?;
    out.write_all(&sum.to_le_bytes())?;
    Ok(())
}

/// Reads one checksummed record. `Ok(None)` means clean EOF; `Err` means a
/// torn/corrupt record was found (the caller truncates to before it).
fn read_record(input: &mut impl std::io::Read) -> OriResult<Option<MetadataEntry>> {
    let mut len_bytes = [0u8; 4];
    match input.read(&mut len_bytes) {
        Ok(0) => return Ok(None),
        Ok(n) if n < 4 => return Err(OriError::corruption("truncated record length")),
        Ok(_) => {}
        Err(e) => return Err(OriError::corruption(format!("reading record length: {e}"))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    input
        .read_exact(&mut payload)
        .map_err(|e| OriError::corruption(format!("reading record payload: {e}")))?;
    let mut sum_bytes = [0u8; 8];
    input
        .read_exact(&mut sum_bytes)
        .map_err(|e| OriError::corruption(format!("reading record checksum: {e}")))?;
    let expected = u64::from_le_bytes(sum_bytes);
    let actual = checksum(&len_bytes, &payload);
    if actual != expected {
        return Err(OriError::corruption("metadata record checksum mismatch"));
    }
    Ok(Some(MetadataEntry::decode(&payload)?))
}

/// A batch of entries staged for one atomic-looking append.
#[derive(Default)]
pub struct Transaction {
    entries: Vec<MetadataEntry>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ref_delta(&mut self, id: HashedId, delta: i32) -> &mut Self {
        self.entries.push(MetadataEntry::RefDelta { id, delta });
        self
    }

    pub fn add_commit_status(&mut self, commit_id: HashedId, status: impl Into<String>) -> &mut Self {
        self.entries.push(MetadataEntry::CommitStatus {
            commit_id,
            status: status.into(),
        });
        self
    }

    pub fn add_key_record(&mut self, fingerprint: impl Into<String>, pem_bytes: Vec<u8>) -> &mut Self {
        self.entries.push(MetadataEntry::KeyRecord {
            fingerprint: fingerprint.into(),
            pem_bytes,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct MetadataLog {
    path: PathBuf,
    log: File,
    refcounts: HashMap<HashedId, i64>,
    statuses: HashMap<HashedId, String>,
    keyring: HashMap<String, Vec<u8>>,
}

impl MetadataLog {
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> OriResult<Self> {
        let mut log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_path(path)?;

        let mut buf = Vec::new();
        log.read_to_end(&mut buf).with_path(path)?;

        let mut refcounts = HashMap::new();
        let mut statuses = HashMap::new();
        let mut keyring = HashMap::new();
        let mut cursor = buf.as_slice();
        let mut valid_len = 0usize;
        loop {
            let before = cursor.len();
            match read_record(&mut cursor) {
                Ok(Some(entry)) => {
                    valid_len += before - cursor.len();
                    apply_entry(&mut refcounts, &mut statuses, &mut keyring, &entry);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        valid_len,
                        "torn metadata record, truncating to last valid record"
                    );
                    break;
                }
            }
        }
        if valid_len < buf.len() {
            log.set_len(valid_len as u64).with_path(path)?;
        }

        Ok(Self {
            path: path.to_owned(),
            log,
            refcounts,
            statuses,
            keyring,
        })
    }

    pub fn get_refcount(&self, id: &HashedId) -> i64 {
        self.refcounts.get(id).copied().unwrap_or(0)
    }

    pub fn refcounts(&self) -> &HashMap<HashedId, i64> {
        &self.refcounts
    }

    pub fn status(&self, commit_id: &HashedId) -> Option<&str> {
        self.statuses.get(commit_id).map(String::as_str)
    }

    pub fn lookup_key(&self, fingerprint: &str) -> Option<&[u8]> {
        self.keyring.get(fingerprint).map(Vec::as_slice)
    }

    pub fn begin() -> Transaction {
        Transaction::new()
    }

    /// Appends every entry in `tx` as its own checksummed record, in one
    /// write + fsync, and folds them into the in-memory maps.
    pub fn commit(&mut self, tx: Transaction) -> OriResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        for entry in &tx.entries {
            write_record(&mut self.log, entry).with_path(&self.path)?;
        }
        self.log.sync_data().with_path(&self.path)?;
        for entry in &tx.entries {
            apply_entry(&mut self.refcounts, &mut self.statuses, &mut self.keyring, entry);
        }
        Ok(())
    }

    /// Rebuilds the log from `truth` (an authoritative refcount map),
    /// preserving the current status and keyring entries, and swaps it in
    /// atomically. Used by gc and by refcount recovery.
    #[tracing::instrument(skip(self, truth))]
    pub fn rewrite(&mut self, truth: Option<&HashMap<HashedId, i64>>) -> OriResult<()> {
        if let Some(truth) = truth {
            self.refcounts = truth.clone();
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).with_path(dir)?;
        for (&id, &count) in &self.refcounts {
            if count == 0 {
                continue;
            }
            let entry = MetadataEntry::RefDelta {
                id,
                delta: count.try_into().unwrap_or(i32::MAX),
            };
            write_record(temp.as_file_mut(), &entry).with_path(&self.path)?;
        }
        for (&commit_id, status) in &self.statuses {
            let entry = MetadataEntry::CommitStatus {
                commit_id,
                status: status.clone(),
            };
            write_record(temp.as_file_mut(), &entry).with_path(&self.path)?;
        }
        for (fingerprint, pem_bytes) in &self.keyring {
            let entry = MetadataEntry::KeyRecord {
                fingerprint: fingerprint.clone(),
                pem_bytes: pem_bytes.clone(),
            };
            write_record(temp.as_file_mut(), &entry).with_path(&self.path)?;
        }
        crate::file_util::persist_temp_file(temp, &self.path).with_path(&self.path)?;
        self.log = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .with_path(&self.path)?;
        tracing::debug!(refcounts = self.refcounts.len(), "metadata log rewritten");
        Ok(())
    }
}

fn apply_entry(
    refcounts: &mut HashMap<HashedId, i64>,
    statuses: &mut HashMap<HashedId, String>,
    keyring: &mut HashMap<String, Vec<u8>>,
    entry: &MetadataEntry,
) {
    match entry {
        MetadataEntry::RefDelta { id, delta } => {
            *refcounts.entry(*id).or_insert(0) += i64::from(*delta);
        }
        MetadataEntry::CommitStatus { commit_id, status } => {
            statuses.insert(*commit_id, status.clone());
        }
        MetadataEntry::KeyRecord {
            fingerprint,
            pem_bytes,
        } => {
            keyring.insert(fingerprint.clone(), pem_bytes.clone());
        }
    }
}
