//! Coordinates the packfile layer and the index into a single content store.

use std::fs;
use std::path::Path;

use crate::codec::Codec;
use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::index::Index;
use crate::index::IndexEntry;
use crate::packfile::ObjectInfo;
use crate::packfile::ObjectType;
use crate::packfile::Packfile;
use crate::packfile_manager::PackfileManager;

/// A handle to a stored object: identity plus a lazily-decoded payload.
pub struct Object {
    pub info: ObjectInfo,
    stored: Vec<u8>,
}

impl Object {
    pub fn payload(&self) -> OriResult<Vec<u8>> {
        self.info.codec().decode(&self.stored)
    }

    pub fn stored_bytes(&self) -> &[u8] {
        &self.stored
    }
}

/// Coordinates packfiles + index into `has`/`get`/`add`/`purge`/`list` plus
/// the zero-copy `transmit`/`receive` surface used by the transfer protocol.
pub struct ObjectStore {
    manager: PackfileManager,
    index: Index,
}

impl ObjectStore {
    pub fn open(objs_dir: &Path, index_path: &Path) -> OriResult<Self> {
        crate::file_util::create_or_reuse_dir(objs_dir).map_err(|e| OriError::Io {
            path: e.path,
            source: e.error,
        })?;
        let manager = PackfileManager::open(objs_dir)?;
        let index = Index::open(index_path)?;
        Ok(Self { manager, index })
    }

    pub fn has(&self, id: &HashedId) -> bool {
        self.index.has(id)
    }

    pub fn info(&self, id: &HashedId) -> OriResult<ObjectInfo> {
        self.index
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| OriError::not_found(id))
    }

    pub fn get(&mut self, id: &HashedId) -> OriResult<Object> {
        let entry = self.index.get(id).cloned().ok_or_else(|| OriError::not_found(id))?;
        let mut pf = self.manager.open_packfile(entry.packfile_id)?;
        let stored = pf.read_stored(entry.offset, entry.stored_size)?;
        Ok(Object {
            info: entry.info,
            stored,
        })
    }

    /// Hashes `canonical_blob`, compresses it per `codec`, and stores it as
    /// a new object of `object_type`. Returns the same id on a repeated
    /// call with identical content, without growing the index again.
    pub fn add(&mut self, object_type: ObjectType, canonical_blob: &[u8], codec: Codec) -> OriResult<HashedId> {
        let id = HashedId::of(canonical_blob);
        if self.index.has(&id) {
            return Ok(id);
        }
        let info = ObjectInfo {
            id,
            object_type,
            flags: codec.flag_bits(),
            payload_size: canonical_blob.len() as u64,
        };
        self.add_with_info(info, canonical_blob)?;
        Ok(id)
    }

    fn add_with_info(&mut self, info: ObjectInfo, canonical_blob: &[u8]) -> OriResult<()> {
        self.manager.roll_if_full()?;
        let packfile_id = self.manager.current_id();
        let mut tx = Packfile::begin();
        tx.add(info, canonical_blob)?;
        let committed = self.manager.current_mut().commit(tx)?;
        self.index.record_committed(packfile_id, &committed)
    }

    /// Stores already-encoded `stored_bytes` verbatim, for zero-copy paths
    /// (receive, graft) where recompression would be wasted work.
    pub fn add_raw(&mut self, info: ObjectInfo, stored_bytes: &[u8]) -> OriResult<()> {
        if self.index.has(&info.id) {
            return Ok(());
        }
        self.manager.roll_if_full()?;
        let packfile_id = self.manager.current_id();
        let framed = crate::packfile::frame_record(&info, stored_bytes)?;
        let committed = self
            .manager
            .current_mut()
            .receive(&mut framed.as_slice(), 1)?;
        self.index.record_committed(packfile_id, &committed)
    }

    pub fn purge(&mut self, id: &HashedId) -> OriResult<()> {
        let entry = self.index.get(id).cloned().ok_or_else(|| OriError::not_found(id))?;
        let mut pf = self.manager.open_packfile(entry.packfile_id)?;
        pf.purge(entry.offset)?;
        let mut purged = entry;
        purged.info.object_type = ObjectType::Purged;
        self.index.update_info(purged)
    }

    pub fn list(&self) -> impl Iterator<Item = &ObjectInfo> {
        self.index.iter().map(|e| &e.info)
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    pub fn manager_mut(&mut self) -> &mut PackfileManager {
        &mut self.manager
    }

    /// Streams the given ids to `sink`, grouped by source packfile, each
    /// group framed as `u32 count || count records`, terminated by a
    /// `count = 0` group.
    pub fn transmit(&mut self, sink: &mut impl std::io::Write, ids: &[HashedId]) -> OriResult<()> {
        use std::collections::BTreeMap;
        let mut by_packfile: BTreeMap<u32, Vec<(ObjectInfo, u64, u64)>> = BTreeMap::new();
        for id in ids {
            let entry = self.index.get(id).cloned().ok_or_else(|| OriError::not_found(id))?;
            by_packfile
                .entry(entry.packfile_id)
                .or_default()
                .push((entry.info, entry.offset, entry.stored_size));
        }
        for (packfile_id, offsets) in by_packfile {
            let mut pf = self.manager.open_packfile(packfile_id)?;
            sink.write_all(&(offsets.len() as u32).to_le_bytes())
                .map_err(|e| OriError::protocol(format!("writing group count: {e}")))?;
            pf.transmit(sink, &offsets)?;
        }
        sink.write_all(&0u32.to_le_bytes())
            .map_err(|e| OriError::protocol(format!("writing terminator: {e}")))?;
        Ok(())
    }

    /// Copies every record into fresh packfiles under a sibling staging
    /// directory and atomically swaps it in, then updates every index entry
    /// to its new location. Purged records are rewritten as header-only
    /// (zero stored bytes), reclaiming the space `Packfile::purge` zeroed
    /// but never shrank, while keeping their id known. Used by gc's
    /// packfile compaction phase.
    #[tracing::instrument(skip(self))]
    pub fn repack(&mut self) -> OriResult<()> {
        let live_dir = self.manager.dir().to_owned();
        let staging_dir = live_dir.with_extension("repack");
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir).map_err(|e| OriError::Io {
                path: staging_dir.clone(),
                source: e,
            })?;
        }
        crate::file_util::create_or_reuse_dir(&staging_dir).map_err(|e| OriError::Io {
            path: e.path,
            source: e.error,
        })?;

        let mut ids: Vec<HashedId> = self.index.iter().map(|e| e.id).collect();
        ids.sort();

        let mut staging = PackfileManager::open(&staging_dir)?;
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = self.index.get(&id).cloned().expect("id came from the index itself");
            let stored = if entry.info.object_type == ObjectType::Purged {
                Vec::new()
            } else {
                let mut pf = self.manager.open_packfile(entry.packfile_id)?;
                pf.read_stored(entry.offset, entry.stored_size)?
            };
            staging.roll_if_full()?;
            let packfile_id = staging.current_id();
            let framed = crate::packfile::frame_record(&entry.info, &stored)?;
            let mut committed = staging.current_mut().receive(&mut framed.as_slice(), 1)?;
            let record = committed.pop().expect("receive(.., 1) returns exactly one record");
            updated.push(IndexEntry {
                id,
                packfile_id,
                offset: record.offset,
                stored_size: record.stored_size,
                info: entry.info,
            });
        }
        drop(staging);

        let parent = live_dir
            .parent()
            .ok_or_else(|| OriError::corruption("objects directory has no parent"))?;
        let backup_dir = parent.join(format!(".objs.repack-backup.{}", std::process::id()));
        fs::rename(&live_dir, &backup_dir).map_err(|e| OriError::Io {
            path: live_dir.clone(),
            source: e,
        })?;
        fs::rename(&staging_dir, &live_dir).map_err(|e| OriError::Io {
            path: staging_dir.clone(),
            source: e,
        })?;
        fs::remove_dir_all(&backup_dir).map_err(|e| OriError::Io {
            path: backup_dir.clone(),
            source: e,
        })?;

        self.manager = PackfileManager::open(&live_dir)?;
        self.index.append_entries(&updated)?;
        self.index.rewrite()?;
        tracing::info!(objects = updated.len(), "packfiles repacked");
        Ok(())
    }

    /// Reads grouped, framed records from `source` until the zero-count
    /// terminator, appending every record into the current packfile and
    /// index, rolling over when full.
    pub fn receive(&mut self, source: &mut impl std::io::Read) -> OriResult<usize> {
        let mut total = 0usize;
        loop {
            let mut count_bytes = [0u8; 4];
            source
                .read_exact(&mut count_bytes)
                .map_err(|e| OriError::protocol(format!("reading group count: {e}")))?;
            let count = u32::from_le_bytes(count_bytes) as usize;
            if count == 0 {
                break;
            }
            self.manager.roll_if_full()?;
            let packfile_id = self.manager.current_id();
            let received = self.manager.current_mut().receive(source, count)?;
            self.index.record_committed(packfile_id, &received)?;
            total += received.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> ObjectStore {
        ObjectStore::open(&dir.join("objs"), &dir.join("index")).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let id = store.add(ObjectType::Blob, b"hello", Codec::None).unwrap();
        let obj = store.get(&id).unwrap();
        assert_eq!(obj.payload().unwrap(), b"hello");
        assert_eq!(obj.info.object_type, ObjectType::Blob);
    }

    #[test]
    fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let id1 = store.add(ObjectType::Blob, b"hello", Codec::None).unwrap();
        let id2 = store.add(ObjectType::Blob, b"hello", Codec::None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.index().len(), 1);
    }

    #[test]
    fn purge_marks_purged_but_keeps_id_known() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let id = store.add(ObjectType::Blob, b"secret", Codec::None).unwrap();
        store.purge(&id).unwrap();
        assert_eq!(store.info(&id).unwrap().object_type, ObjectType::Purged);
        assert!(!store.has(&id));
    }

    #[test]
    fn repack_preserves_live_objects_and_drops_purged_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let kept = store.add(ObjectType::Blob, b"kept", Codec::None).unwrap();
        let doomed = store.add(ObjectType::Blob, b"doomed", Codec::None).unwrap();
        store.purge(&doomed).unwrap();

        store.repack().unwrap();

        assert!(store.has(&kept));
        assert_eq!(store.get(&kept).unwrap().payload().unwrap(), b"kept");
        assert_eq!(store.info(&doomed).unwrap().object_type, ObjectType::Purged);
        assert!(!store.has(&doomed));
    }

    #[test]
    fn transmit_then_receive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = open_store(dir.path());
        let id = src.add(ObjectType::Blob, b"payload", Codec::None).unwrap();

        let mut wire = Vec::new();
        src.transmit(&mut wire, &[id]).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let mut dst = open_store(dst_dir.path());
        let n = dst.receive(&mut wire.as_slice()).unwrap();
        assert_eq!(n, 1);
        assert!(dst.has(&id));
        assert_eq!(dst.get(&id).unwrap().payload().unwrap(), b"payload");
    }
}
