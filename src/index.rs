//! The durable map from [`HashedId`] to packfile location.
//!
//! The in-memory [`std::collections::HashMap`] is the authoritative view;
//! the on-disk log is its durable shadow, replayed on open and rewritten
//! wholesale during compaction or recovery.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::error::IoResultExt as _;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::hash::HASH_LEN;
use crate::packfile::CommittedRecord;
use crate::packfile::ObjectInfo;
use crate::packfile::ObjectType;
use crate::packfile_manager::PackfileManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: HashedId,
    pub packfile_id: u32,
    pub offset: u64,
    pub stored_size: u64,
    pub info: ObjectInfo,
}

fn object_type_tag(t: ObjectType) -> &'static [u8; 4] {
    match t {
        ObjectType::Commit => b"CMMT",
        ObjectType::Tree => b"TREE",
        ObjectType::Blob => b"BLOB",
        ObjectType::LargeBlob => b"LGBL",
        ObjectType::Purged => b"PURG",
    }
}

fn object_type_from_tag(tag: [u8; 4]) -> Option<ObjectType> {
    match &tag {
        b"CMMT" => Some(ObjectType::Commit),
        b"TREE" => Some(ObjectType::Tree),
        b"BLOB" => Some(ObjectType::Blob),
        b"LGBL" => Some(ObjectType::LargeBlob),
        b"PURG" => Some(ObjectType::Purged),
        _ => None,
    }
}

fn write_entry(out: &mut impl std::io::Write, entry: &IndexEntry) -> std::io::Result<()> {
    out.write_all(entry.id.as_bytes())?;
    out.write_all(&entry.packfile_id.to_le_bytes())?;
    out.write_all(&entry.offset.to_le_bytes())?;
    out.write_all(&entry.stored_size.to_le_bytes())?;
    out.write_all(object_type_tag(entry.info.object_type))?;
    out.write_all(&entry.info.flags.to_le_bytes())?;
    out.write_all(&entry.info.payload_size.to_le_bytes())?;
    Ok(())
}

/// Reads one record, returning `None` at a clean EOF and `Err` on a
/// truncated/partial tail (distinguished so `open` can recover from it).
fn read_entry(input: &mut impl std::io::Read) -> std::io::Result<Option<IndexEntry>> {
    let mut id_bytes = [0u8; HASH_LEN];
    match input.read(&mut id_bytes) {
        Ok(0) => return Ok(None),
        Ok(n) if n < HASH_LEN => {
            input.read_exact(&mut id_bytes[n..])?;
        }
        Ok(_) => {}
        Err(e) => return Err(e),
    }
    let id = HashedId::from_bytes(id_bytes);

    let mut packfile_id_bytes = [0u8; 4];
    input.read_exact(&mut packfile_id_bytes)?;
    let packfile_id = u32::from_le_bytes(packfile_id_bytes);

    let mut offset_bytes = [0u8; 8];
    input.read_exact(&mut offset_bytes)?;
    let offset = u64::from_le_bytes(offset_bytes);

    let mut stored_size_bytes = [0u8; 8];
    input.read_exact(&mut stored_size_bytes)?;
    let stored_size = u64::from_le_bytes(stored_size_bytes);

    let mut type_tag = [0u8; 4];
    input.read_exact(&mut type_tag)?;
    let object_type = object_type_from_tag(type_tag).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown object type tag")
    })?;

    let mut flags_bytes = [0u8; 4];
    input.read_exact(&mut flags_bytes)?;
    let flags = u32::from_le_bytes(flags_bytes);

    let mut payload_size_bytes = [0u8; 8];
    input.read_exact(&mut payload_size_bytes)?;
    let payload_size = u64::from_le_bytes(payload_size_bytes);

    Ok(Some(IndexEntry {
        id,
        packfile_id,
        offset,
        stored_size,
        info: ObjectInfo {
            id,
            object_type,
            flags,
            payload_size,
        },
    }))
}

/// The live `HashedId -> IndexEntry` map plus its durable log file.
pub struct Index {
    path: PathBuf,
    log: File,
    map: HashMap<HashedId, IndexEntry>,
}

impl Index {
    /// Opens (creating if absent) the index log at `path`, replaying it
    /// into the in-memory map. A truncated trailing record is tolerated:
    /// the log is truncated back to the last complete record and a warning
    /// is logged, matching the open-time corruption recovery policy.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> OriResult<Self> {
        let mut log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_path(path)?;

        let mut map = HashMap::new();
        let mut reader = {
            let mut buf = Vec::new();
            log.read_to_end(&mut buf).with_path(path)?;
            buf
        };
        let mut cursor = reader.as_slice();
        let mut valid_len: u64 = 0;
        loop {
            let before_len = cursor.len() as u64;
            match read_entry(&mut cursor) {
                Ok(Some(entry)) => {
                    valid_len += before_len - cursor.len() as u64;
                    map.insert(entry.id, entry);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        valid_len,
                        "truncated index tail, recovering by discarding partial record"
                    );
                    break;
                }
            }
        }
        if (valid_len as usize) < reader.len() {
            reader.truncate(valid_len as usize);
            log.set_len(valid_len).with_path(path)?;
        }

        Ok(Self {
            path: path.to_owned(),
            log,
            map,
        })
    }

    pub fn has(&self, id: &HashedId) -> bool {
        self.map
            .get(id)
            .is_some_and(|e| e.info.object_type != ObjectType::Purged)
    }

    pub fn get(&self, id: &HashedId) -> Option<&IndexEntry> {
        self.map.get(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.map.values()
    }

    /// Appends `entries` to the durable log and folds them into the map.
    pub fn append_entries(&mut self, entries: &[IndexEntry]) -> OriResult<()> {
        for entry in entries {
            write_entry(&mut self.log, entry).with_path(&self.path)?;
        }
        self.log.sync_data().with_path(&self.path)?;
        for entry in entries {
            self.map.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    pub fn record_committed(&mut self, packfile_id: u32, committed: &[CommittedRecord]) -> OriResult<()> {
        let entries: Vec<IndexEntry> = committed
            .iter()
            .map(|c| IndexEntry {
                id: c.info.id,
                packfile_id,
                offset: c.offset,
                stored_size: c.stored_size,
                info: c.info.clone(),
            })
            .collect();
        self.append_entries(&entries)
    }

    /// Updates (or inserts) a single entry, e.g. after a purge.
    pub fn update_info(&mut self, entry: IndexEntry) -> OriResult<()> {
        self.append_entries(std::slice::from_ref(&entry))
    }

    /// Rewrites the log from the live in-memory map and atomically swaps it
    /// in, compacting away superseded records.
    #[tracing::instrument(skip(self))]
    pub fn rewrite(&mut self) -> OriResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).with_path(dir)?;
        for entry in self.map.values() {
            write_entry(temp.as_file_mut(), entry).with_path(&self.path)?;
        }
        crate::file_util::persist_temp_file(temp, &self.path).with_path(&self.path)?;
        self.log = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .with_path(&self.path)?;
        tracing::debug!(entries = self.map.len(), "index rewritten");
        Ok(())
    }

    /// Resolves the open question of an incomplete `rebuildIndex()`: scans
    /// every packfile from scratch and replaces the live map wholesale,
    /// then persists it. Used when the index log itself is corrupt beyond
    /// what `open`'s truncation recovery can handle.
    #[tracing::instrument(skip(self, manager))]
    pub fn rebuild_from_packfiles(&mut self, manager: &mut PackfileManager) -> OriResult<()> {
        let mut map = HashMap::new();
        for id in manager.all_ids() {
            let mut pf = manager.open_packfile(id)?;
            for record in pf.scan()? {
                map.insert(
                    record.info.id,
                    IndexEntry {
                        id: record.info.id,
                        packfile_id: id,
                        offset: record.offset,
                        stored_size: record.stored_size,
                        info: record.info,
                    },
                );
            }
        }
        tracing::info!(entries = map.len(), "index rebuilt from packfile scan");
        self.map = map;
        self.rewrite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packfile::ObjectInfo;

    fn entry(byte: u8) -> IndexEntry {
        let id = HashedId::of(&[byte]);
        IndexEntry {
            id,
            packfile_id: 0,
            offset: 0,
            stored_size: 10,
            info: ObjectInfo {
                id,
                object_type: ObjectType::Blob,
                flags: 0,
                payload_size: 5,
            },
        }
    }

    #[test]
    fn open_close_open_preserves_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let mut idx = Index::open(&path).unwrap();
            idx.append_entries(&[entry(1), entry(2)]).unwrap();
        }
        let idx = Index::open(&path).unwrap();
        assert_eq!(idx.len(), 2);
        assert!(idx.has(&entry(1).id));
    }

    #[test]
    fn truncated_tail_is_recovered_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let mut idx = Index::open(&path).unwrap();
            idx.append_entries(&[entry(1)]).unwrap();
        }
        // Simulate a torn write: append a few stray bytes.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let idx = Index::open(&path).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn rewrite_compacts_superseded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut idx = Index::open(&path).unwrap();
        idx.append_entries(&[entry(1)]).unwrap();
        let mut updated = entry(1);
        updated.info.object_type = ObjectType::Purged;
        idx.append_entries(&[updated]).unwrap();
        idx.rewrite().unwrap();
        drop(idx);
        let idx = Index::open(&path).unwrap();
        assert_eq!(idx.len(), 1);
        assert!(!idx.has(&entry(1).id));
    }
}
