//! Append-only packfiles: the on-disk container of object payloads.
//!
//! A packfile is a sequence of fixed-shape record headers each immediately
//! followed by `stored_size` bytes of (possibly compressed) payload. Sealed
//! packfiles are immutable except for in-place purge, which zeroes the
//! payload and rewrites the header's type tag to `Purged` without shrinking
//! the file.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use crate::codec::Codec;
use crate::error::IoResultExt as _;
use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::hash::HASH_LEN;

/// Default soft cap, in bytes, past which a packfile is considered sealed.
pub const DEFAULT_PACKFILE_SOFT_CAP: u64 = 64 * 1024 * 1024;

/// Default threshold, in staged stored bytes, past which a transaction is
/// considered full and should be committed.
pub const DEFAULT_TRANSACTION_THRESHOLD: u64 = 4 * 1024 * 1024;

const MAGIC_VALID: u8 = 0xA1;
const MAGIC_END: u8 = 0x00;

/// `1 (magic) + 4 (type tag) + 4 (flags) + 8 (payload_size) + 8 (stored_size) + 32 (id)`.
const RECORD_HEADER_LEN: u64 = 1 + 4 + 4 + 8 + 8 + HASH_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    LargeBlob,
    Purged,
}

impl ObjectType {
    fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::Commit => b"CMMT",
            Self::Tree => b"TREE",
            Self::Blob => b"BLOB",
            Self::LargeBlob => b"LGBL",
            Self::Purged => b"PURG",
        }
    }

    fn from_tag(tag: [u8; 4]) -> OriResult<Self> {
        match &tag {
            b"CMMT" => Ok(Self::Commit),
            b"TREE" => Ok(Self::Tree),
            b"BLOB" => Ok(Self::Blob),
            b"LGBL" => Ok(Self::LargeBlob),
            b"PURG" => Ok(Self::Purged),
            _ => Err(OriError::corruption(format!(
                "unknown object type tag {:?}",
                String::from_utf8_lossy(&tag)
            ))),
        }
    }
}

/// Identity, type, codec flags, and decoded size of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: HashedId,
    pub object_type: ObjectType,
    pub flags: u32,
    pub payload_size: u64,
}

impl ObjectInfo {
    pub fn codec(&self) -> Codec {
        Codec::from_flags(self.flags)
    }
}

fn write_record_header(
    out: &mut impl std::io::Write,
    info: &ObjectInfo,
    stored_size: u64,
) -> OriResult<()> {
    out.write_all(&[MAGIC_VALID])
        .and_then(|()| out.write_all(info.object_type.tag()))
        .and_then(|()| out.write_all(&info.flags.to_le_bytes()))
        .and_then(|()| out.write_all(&info.payload_size.to_le_bytes()))
        .and_then(|()| out.write_all(&stored_size.to_le_bytes()))
        .and_then(|()| out.write_all(info.id.as_bytes()))
        .map_err(|e| OriError::corruption(format!("writing record header: {e}")))
}

/// Encodes a single `(info, stored_bytes)` record exactly as it would be
/// written to a packfile, for callers that need to hand a pre-framed
/// record to [`Packfile::receive`] (e.g. a zero-copy local store-to-store
/// copy during graft).
pub fn frame_record(info: &ObjectInfo, stored_bytes: &[u8]) -> OriResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + stored_bytes.len());
    write_record_header(&mut buf, info, stored_bytes.len() as u64)?;
    buf.extend_from_slice(stored_bytes);
    Ok(buf)
}

/// Reads one record header, or `None` if the stream has logically ended
/// (EOF, or an explicit zero magic byte).
fn read_record_header(input: &mut impl std::io::Read) -> OriResult<Option<(ObjectInfo, u64)>> {
    let mut magic = [0u8; 1];
    match input.read(&mut magic) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(OriError::corruption(format!("reading record magic: {e}"))),
    }
    if magic[0] == MAGIC_END {
        return Ok(None);
    }
    if magic[0] != MAGIC_VALID {
        return Err(OriError::corruption(format!(
            "bad record magic byte {:#04x}",
            magic[0]
        )));
    }

    let mut tag = [0u8; 4];
    input
        .read_exact(&mut tag)
        .map_err(|e| OriError::corruption(format!("reading type tag: {e}")))?;
    let object_type = ObjectType::from_tag(tag)?;

    let mut flags_bytes = [0u8; 4];
    input
        .read_exact(&mut flags_bytes)
        .map_err(|e| OriError::corruption(format!("reading flags: {e}")))?;
    let flags = u32::from_le_bytes(flags_bytes);

    let mut payload_size_bytes = [0u8; 8];
    input
        .read_exact(&mut payload_size_bytes)
        .map_err(|e| OriError::corruption(format!("reading payload_size: {e}")))?;
    let payload_size = u64::from_le_bytes(payload_size_bytes);

    let mut stored_size_bytes = [0u8; 8];
    input
        .read_exact(&mut stored_size_bytes)
        .map_err(|e| OriError::corruption(format!("reading stored_size: {e}")))?;
    let stored_size = u64::from_le_bytes(stored_size_bytes);

    let mut id_bytes = [0u8; HASH_LEN];
    input
        .read_exact(&mut id_bytes)
        .map_err(|e| OriError::corruption(format!("reading id: {e}")))?;
    let id = HashedId::from_bytes(id_bytes);

    Ok(Some((
        ObjectInfo {
            id,
            object_type,
            flags,
            payload_size,
        },
        stored_size,
    )))
}

/// One staged (info, stored payload) pair inside an in-progress transaction.
struct StagedRecord {
    info: ObjectInfo,
    stored: Vec<u8>,
}

/// A batch of records staged in memory, not yet durable.
pub struct Transaction {
    records: Vec<StagedRecord>,
    staged_bytes: u64,
}

impl Transaction {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            staged_bytes: 0,
        }
    }

    /// Stages `payload` for append, compressing it per `info.flags`.
    /// Returns the index of this record within the transaction.
    pub fn add(&mut self, info: ObjectInfo, payload: &[u8]) -> OriResult<usize> {
        let stored = info.codec().encode(payload)?;
        self.staged_bytes += stored.len() as u64;
        self.records.push(StagedRecord { info, stored });
        Ok(self.records.len() - 1)
    }

    pub fn full(&self) -> bool {
        self.staged_bytes > DEFAULT_TRANSACTION_THRESHOLD
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// A committed record's location, returned by [`Packfile::commit`] and
/// [`Packfile::receive`] for the caller to fold into the [`crate::index::Index`].
#[derive(Debug, Clone)]
pub struct CommittedRecord {
    pub info: ObjectInfo,
    pub offset: u64,
    pub stored_size: u64,
}

/// One append-only on-disk packfile.
pub struct Packfile {
    pub id: u32,
    path: PathBuf,
    file: File,
}

impl Packfile {
    pub fn file_name(id: u32) -> String {
        format!("pack.{id:08x}")
    }

    pub fn create(dir: &Path, id: u32) -> OriResult<Self> {
        let path = dir.join(Self::file_name(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_path(&path)?;
        Ok(Self { id, path, file })
    }

    pub fn open(dir: &Path, id: u32) -> OriResult<Self> {
        let path = dir.join(Self::file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_path(&path)?;
        Ok(Self { id, path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> OriResult<u64> {
        Ok(self.file.metadata().with_path(&self.path)?.len())
    }

    pub fn is_full(&self) -> OriResult<bool> {
        Ok(self.len()? > DEFAULT_PACKFILE_SOFT_CAP)
    }

    pub fn begin() -> Transaction {
        Transaction::new()
    }

    /// Appends every record staged in `tx` to this packfile, fsyncing the
    /// data before returning. If the write fails partway through, the
    /// partial tail is left for the next `open`'s recovery scan to ignore.
    #[tracing::instrument(skip(self, tx), fields(packfile = self.id, records = tx.len()))]
    pub fn commit(&mut self, tx: Transaction) -> OriResult<Vec<CommittedRecord>> {
        let mut offset = self.len()?;
        self.file
            .seek(SeekFrom::End(0))
            .with_path(&self.path)?;
        let mut committed = Vec::with_capacity(tx.records.len());
        for record in &tx.records {
            write_record_header(&mut self.file, &record.info, record.stored.len() as u64)
                .map_err(|e| OriError::corruption(format!("{} in {}", e, self.path.display())))?;
            self.file
                .write_all(&record.stored)
                .with_path(&self.path)?;
            committed.push(CommittedRecord {
                info: record.info.clone(),
                offset,
                stored_size: record.stored.len() as u64,
            });
            offset += RECORD_HEADER_LEN + record.stored.len() as u64;
        }
        self.file.sync_data().with_path(&self.path)?;
        tracing::debug!(packfile = self.id, bytes = offset, "packfile committed");
        Ok(committed)
    }

    /// Rewrites the header at `offset` to type `Purged` and zeroes the
    /// payload bytes. The record's length on disk is unchanged.
    pub fn purge(&mut self, offset: u64) -> OriResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .with_path(&self.path)?;
        let (info, stored_size) = read_record_header(&mut self.file)?.ok_or_else(|| {
            OriError::corruption(format!("no record at offset {offset} in {}", self.path.display()))
        })?;
        // type_tag begins right after the single magic byte.
        self.file
            .seek(SeekFrom::Start(offset + 1))
            .with_path(&self.path)?;
        self.file
            .write_all(ObjectType::Purged.tag())
            .with_path(&self.path)?;
        self.file
            .seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))
            .with_path(&self.path)?;
        let zeros = vec![0u8; stored_size as usize];
        self.file.write_all(&zeros).with_path(&self.path)?;
        self.file.sync_data().with_path(&self.path)?;
        let _ = info;
        Ok(())
    }

    /// Reads back the raw stored bytes for a record at `offset`, without
    /// decompressing.
    pub fn read_stored(&mut self, offset: u64, stored_size: u64) -> OriResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))
            .with_path(&self.path)?;
        let mut buf = vec![0u8; stored_size as usize];
        self.file.read_exact(&mut buf).with_path(&self.path)?;
        Ok(buf)
    }

    /// Streams `(info, stored_size, stored_bytes)` triples for `offsets` to
    /// `sink`, copying stored bytes verbatim without recompression.
    pub fn transmit(
        &mut self,
        sink: &mut impl std::io::Write,
        offsets: &[(ObjectInfo, u64, u64)],
    ) -> OriResult<()> {
        for (info, offset, stored_size) in offsets {
            let bytes = self.read_stored(*offset, *stored_size)?;
            write_record_header(sink, info, *stored_size)
                .map_err(|e| OriError::protocol(format!("transmit header: {e}")))?;
            sink.write_all(&bytes)
                .map_err(|e| OriError::protocol(format!("transmit payload: {e}")))?;
        }
        Ok(())
    }

    /// Reads `count` `(info, stored_size, stored_bytes)` triples from
    /// `source` and appends them verbatim, returning their new locations.
    pub fn receive(
        &mut self,
        source: &mut impl std::io::Read,
        count: usize,
    ) -> OriResult<Vec<CommittedRecord>> {
        let mut offset = self.len()?;
        self.file.seek(SeekFrom::End(0)).with_path(&self.path)?;
        let mut received = Vec::with_capacity(count);
        for _ in 0..count {
            let (info, stored_size) = read_record_header(source)?
                .ok_or_else(|| OriError::protocol("receive: stream ended before count reached"))?;
            let mut payload = vec![0u8; stored_size as usize];
            source
                .read_exact(&mut payload)
                .map_err(|e| OriError::protocol(format!("receive payload: {e}")))?;
            write_record_header(&mut self.file, &info, stored_size)
                .map_err(|e| OriError::corruption(format!("{e}")))?;
            self.file.write_all(&payload).with_path(&self.path)?;
            received.push(CommittedRecord {
                info,
                offset,
                stored_size,
            });
            offset += RECORD_HEADER_LEN + stored_size;
        }
        self.file.sync_data().with_path(&self.path)?;
        Ok(received)
    }

    /// Scans every record in this packfile from the start, for index
    /// rebuilding. Stops at the first logical end marker or truncated tail.
    pub fn scan(&mut self) -> OriResult<Vec<CommittedRecord>> {
        self.file.seek(SeekFrom::Start(0)).with_path(&self.path)?;
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let before = offset;
            match read_record_header(&mut self.file) {
                Ok(Some((info, stored_size))) => {
                    offset = before + RECORD_HEADER_LEN + stored_size;
                    self.file
                        .seek(SeekFrom::Start(offset))
                        .with_path(&self.path)?;
                    out.push(CommittedRecord {
                        info,
                        offset: before,
                        stored_size,
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(packfile = self.id, offset = before, "truncated record tail, stopping scan");
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(payload: &[u8]) -> ObjectInfo {
        ObjectInfo {
            id: HashedId::of(payload),
            object_type: ObjectType::Blob,
            flags: 0,
            payload_size: payload.len() as u64,
        }
    }

    #[test]
    fn commit_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = Packfile::create(dir.path(), 1).unwrap();
        let mut tx = Packfile::begin();
        let payload = b"hello";
        tx.add(sample_info(payload), payload).unwrap();
        let committed = pf.commit(tx).unwrap();
        assert_eq!(committed.len(), 1);
        let rec = &committed[0];
        let stored = pf.read_stored(rec.offset, rec.stored_size).unwrap();
        assert_eq!(Codec::from_flags(rec.info.flags).decode(&stored).unwrap(), payload);
    }

    #[test]
    fn purge_zeroes_payload_and_marks_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = Packfile::create(dir.path(), 1).unwrap();
        let mut tx = Packfile::begin();
        let payload = b"secret";
        tx.add(sample_info(payload), payload).unwrap();
        let committed = pf.commit(tx).unwrap();
        let rec = &committed[0];
        pf.purge(rec.offset).unwrap();
        let rescan = pf.scan().unwrap();
        assert_eq!(rescan.len(), 1);
        assert_eq!(rescan[0].info.object_type, ObjectType::Purged);
        let stored = pf.read_stored(rec.offset, rec.stored_size).unwrap();
        assert!(stored.iter().all(|&b| b == 0));
    }

    #[test]
    fn scan_recovers_multiple_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = Packfile::create(dir.path(), 1).unwrap();
        let mut tx = Packfile::begin();
        tx.add(sample_info(b"one"), b"one").unwrap();
        tx.add(sample_info(b"two"), b"two").unwrap();
        pf.commit(tx).unwrap();
        let rescan = pf.scan().unwrap();
        assert_eq!(rescan.len(), 2);
    }

    #[test]
    fn transmit_then_receive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Packfile::create(dir.path(), 1).unwrap();
        let mut tx = Packfile::begin();
        let payload = b"transfer me";
        tx.add(sample_info(payload), payload).unwrap();
        let committed = src.commit(tx).unwrap();
        let offsets: Vec<_> = committed
            .iter()
            .map(|c| (c.info.clone(), c.offset, c.stored_size))
            .collect();

        let mut wire = Vec::new();
        src.transmit(&mut wire, &offsets).unwrap();

        let mut dst = Packfile::create(dir.path(), 2).unwrap();
        let received = dst.receive(&mut wire.as_slice(), offsets.len()).unwrap();
        assert_eq!(received.len(), 1);
        let stored = dst
            .read_stored(received[0].offset, received[0].stored_size)
            .unwrap();
        assert_eq!(stored, payload);
    }

    #[test]
    fn transaction_full_threshold() {
        let mut tx = Packfile::begin();
        assert!(!tx.full());
        let big = vec![b'x'; (DEFAULT_TRANSACTION_THRESHOLD + 1) as usize];
        tx.add(sample_info(&big), &big).unwrap();
        assert!(tx.full());
    }
}
