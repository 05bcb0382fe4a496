//! Split representation for files too large to store as a single `Blob`.
//!
//! Chunk boundaries are chosen with a content-defined chunking scheme (a
//! gear hash, the same family of rolling hash used by rsync/restic-style
//! deduplicating stores) so that a small edit to a large file only
//! invalidates the chunks touching the edit, not the whole file. A
//! deterministic fixed-window strategy is offered alongside it for callers
//! that want predictable chunk sizes instead.

use crate::codec::Codec;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::object_store::ObjectStore;
use crate::packfile::ObjectType;
use crate::typed_stream::Reader;
use crate::typed_stream::Writer;

/// Target average chunk size for content-defined chunking.
pub const TARGET_CHUNK_SIZE: usize = 256 * 1024;
/// Hard maximum chunk size; a boundary is forced here even if the rolling
/// hash hasn't found one.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
/// Minimum chunk size before the rolling hash is even consulted, avoiding
/// pathological runs of tiny chunks.
const MIN_CHUNK_SIZE: usize = 64 * 1024;

/// Low `CHUNK_MASK_BITS` bits of the rolling hash must be zero to cut a
/// boundary; chosen so the expected run length is `TARGET_CHUNK_SIZE`.
const CHUNK_MASK_BITS: u32 = 18; // 2^18 == 256 KiB

fn chunk_mask() -> u64 {
    (1u64 << CHUNK_MASK_BITS) - 1
}

/// A fixed, deterministic substitute for a random gear table: splitmix64
/// applied to each byte value. Any fixed table works for content-defined
/// chunking as long as every run of this code uses the same one.
fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0u64;
    while (i as usize) < table.len() {
        let mut z = i.wrapping_add(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        table[i as usize] = z;
        i += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    ContentDefined,
    FixedWindow(usize),
}

/// Returns `(offset, length)` pairs covering all of `data`, in order.
pub fn chunk_offsets(data: &[u8], strategy: ChunkingStrategy) -> Vec<(u64, u64)> {
    if data.is_empty() {
        return Vec::new();
    }
    match strategy {
        ChunkingStrategy::FixedWindow(window) => {
            let window = window.max(1);
            let mut out = Vec::new();
            let mut offset = 0usize;
            while offset < data.len() {
                let len = window.min(data.len() - offset);
                out.push((offset as u64, len as u64));
                offset += len;
            }
            out
        }
        ChunkingStrategy::ContentDefined => content_defined_chunk_offsets(data),
    }
}

fn content_defined_chunk_offsets(data: &[u8]) -> Vec<(u64, u64)> {
    let table = gear_table();
    let mask = chunk_mask();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut hash: u64 = 0;
    let mut i = 0usize;
    while i < data.len() {
        hash = (hash << 1).wrapping_add(table[data[i] as usize]);
        let len = i - start + 1;
        if len >= MIN_CHUNK_SIZE && (hash & mask) == 0 {
            out.push((start as u64, len as u64));
            start = i + 1;
            hash = 0;
        } else if len >= MAX_CHUNK_SIZE {
            out.push((start as u64, len as u64));
            start = i + 1;
            hash = 0;
        }
        i += 1;
    }
    if start < data.len() {
        out.push((start as u64, (data.len() - start) as u64));
    }
    out
}

/// An ordered mapping from byte offset to the chunk stored there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LargeBlob {
    parts: Vec<(u64, u64, HashedId)>,
}

impl LargeBlob {
    pub fn parts(&self) -> &[(u64, u64, HashedId)] {
        &self.parts
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.parts.len() as u32);
        for (offset, length, chunk) in &self.parts {
            w.write_u64(*offset);
            w.write_u64(*length);
            w.write_hash(chunk);
        }
        w.into_bytes()
    }

    pub fn from_blob(bytes: &[u8]) -> OriResult<Self> {
        let mut r = Reader::new(bytes);
        let count = r.read_u32()?;
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = r.read_u64()?;
            let length = r.read_u64()?;
            let chunk = r.read_hash()?;
            parts.push((offset, length, chunk));
        }
        Ok(Self { parts })
    }

    /// Splits `data` into chunks per `strategy`, stores each chunk as a
    /// `Blob`, stores the resulting chunk table as a `LargeBlob`, and
    /// returns its id. Chunking is deterministic: equal inputs yield equal
    /// chunk sets and thus equal ids.
    pub fn split(
        store: &mut ObjectStore,
        data: &[u8],
        strategy: ChunkingStrategy,
        codec: Codec,
    ) -> OriResult<HashedId> {
        let offsets = chunk_offsets(data, strategy);
        let mut parts = Vec::with_capacity(offsets.len());
        for (offset, length) in offsets {
            let chunk_bytes = &data[offset as usize..(offset + length) as usize];
            let chunk_id = store.add(ObjectType::Blob, chunk_bytes, codec)?;
            parts.push((offset, length, chunk_id));
        }
        let large_blob = Self { parts };
        store.add(ObjectType::LargeBlob, &large_blob.to_blob(), codec)
    }

    /// Reconstructs the full byte sequence by concatenating chunk payloads
    /// in offset order.
    pub fn reconstruct(store: &mut ObjectStore, id: &HashedId) -> OriResult<Vec<u8>> {
        let object = store.get(id)?;
        let large_blob = Self::from_blob(&object.payload()?)?;
        let mut out = Vec::new();
        for (_, _, chunk_id) in &large_blob.parts {
            let chunk = store.get(chunk_id)?;
            out.extend(chunk.payload()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_offsets(b"", ChunkingStrategy::ContentDefined).is_empty());
    }

    #[test]
    fn fixed_window_covers_input_exactly() {
        let data = vec![0u8; 1000];
        let offsets = chunk_offsets(&data, ChunkingStrategy::FixedWindow(300));
        let total: u64 = offsets.iter().map(|(_, len)| len).sum();
        assert_eq!(total, 1000);
        assert_eq!(offsets.len(), 4);
    }

    #[test]
    fn content_defined_chunking_is_deterministic() {
        let data = (0..5_000_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let a = chunk_offsets(&data, ChunkingStrategy::ContentDefined);
        let b = chunk_offsets(&data, ChunkingStrategy::ContentDefined);
        assert_eq!(a, b);
        let total: u64 = a.iter().map(|(_, len)| len).sum();
        assert_eq!(total, data.len() as u64);
        for (_, len) in &a {
            assert!(*len as usize <= MAX_CHUNK_SIZE);
        }
    }

    #[test]
    fn split_then_reconstruct_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ObjectStore::open(&dir.path().join("objs"), &dir.path().join("index")).unwrap();
        let data = (0..3_000_000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        let id = LargeBlob::split(&mut store, &data, ChunkingStrategy::ContentDefined, Codec::None).unwrap();
        let back = LargeBlob::reconstruct(&mut store, &id).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn single_chunk_large_blob_differs_in_type_from_blob_with_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ObjectStore::open(&dir.path().join("objs"), &dir.path().join("index")).unwrap();
        let data = b"small enough to be one chunk";
        let large_blob_id = LargeBlob::split(&mut store, data, ChunkingStrategy::FixedWindow(1 << 20), Codec::None).unwrap();
        let blob_id = store.add(ObjectType::Blob, data, Codec::None).unwrap();
        // Same payload bytes end up in the chunk, so the chunk's own blob id
        // equals a plain Blob's id, but the LargeBlob index object's id
        // (what a Tree entry of kind LargeBlob would reference) differs
        // because its canonical blob is the chunk table, not the raw bytes.
        assert_ne!(large_blob_id, blob_id);
    }
}
