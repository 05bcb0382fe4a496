//! Directory (`Tree`) entities and their per-entry attribute maps.

use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::typed_stream::Reader;
use crate::typed_stream::Writer;

pub const ATTR_PERMISSIONS: &str = "permissions";
pub const ATTR_OWNER: &str = "owner";
pub const ATTR_GROUP: &str = "group";
pub const ATTR_SIZE: &str = "size";
pub const ATTR_MTIME: &str = "mtime";
pub const ATTR_CTIME: &str = "ctime";

const ATTR_TAG_U32: u8 = 1;
const ATTR_TAG_U64: u8 = 2;
const ATTR_TAG_STR: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    U32(u32),
    U64(u64),
    Str(String),
}

/// Typed per-entry attributes. Required keys ([`ATTR_PERMISSIONS`],
/// [`ATTR_OWNER`], [`ATTR_GROUP`], [`ATTR_SIZE`], [`ATTR_MTIME`],
/// [`ATTR_CTIME`]) are always present on a constructed `AttrMap`; the
/// representation otherwise allows arbitrary additional keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttrMap {
    entries: Vec<(String, AttrValue)>,
}

impl AttrMap {
    pub fn new(permissions: u32, owner: impl Into<String>, group: impl Into<String>, size: u64, mtime: u64, ctime: u64) -> Self {
        let mut map = Self::default();
        map.set(ATTR_PERMISSIONS, AttrValue::U32(permissions));
        map.set(ATTR_OWNER, AttrValue::Str(owner.into()));
        map.set(ATTR_GROUP, AttrValue::Str(group.into()));
        map.set(ATTR_SIZE, AttrValue::U64(size));
        map.set(ATTR_MTIME, AttrValue::U64(mtime));
        map.set(ATTR_CTIME, AttrValue::U64(ctime));
        map
    }

    pub fn set(&mut self, key: &str, value: AttrValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_owned(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn permissions(&self) -> OriResult<u32> {
        match self.get(ATTR_PERMISSIONS) {
            Some(AttrValue::U32(v)) => Ok(*v),
            _ => Err(OriError::corruption("missing or mistyped 'permissions' attr")),
        }
    }

    pub fn size(&self) -> OriResult<u64> {
        match self.get(ATTR_SIZE) {
            Some(AttrValue::U64(v)) => Ok(*v),
            _ => Err(OriError::corruption("missing or mistyped 'size' attr")),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            w.write_pstr(key);
            match value {
                AttrValue::U32(v) => {
                    w.write_u8(ATTR_TAG_U32);
                    w.write_u32(*v);
                }
                AttrValue::U64(v) => {
                    w.write_u8(ATTR_TAG_U64);
                    w.write_u64(*v);
                }
                AttrValue::Str(v) => {
                    w.write_u8(ATTR_TAG_STR);
                    w.write_pstr(v);
                }
            }
        }
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> OriResult<Self> {
        let mut r = Reader::new(bytes);
        let count = r.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = r.read_pstr()?;
            let value = match r.read_u8()? {
                ATTR_TAG_U32 => AttrValue::U32(r.read_u32()?),
                ATTR_TAG_U64 => AttrValue::U64(r.read_u64()?),
                ATTR_TAG_STR => AttrValue::Str(r.read_pstr()?),
                other => return Err(OriError::corruption(format!("unknown attr value tag {other}"))),
            };
            entries.push((key, value));
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tree,
    Blob,
    LargeBlob,
}

impl EntryKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Tree => 0,
            Self::Blob => 1,
            Self::LargeBlob => 2,
        }
    }

    fn from_u8(v: u8) -> OriResult<Self> {
        match v {
            0 => Ok(Self::Tree),
            1 => Ok(Self::Blob),
            2 => Ok(Self::LargeBlob),
            other => Err(OriError::corruption(format!("unknown tree entry kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub child_id: HashedId,
    pub attrs: AttrMap,
}

/// An ordered mapping from child name to [`TreeEntry`], serialized in
/// name-sorted order so that two trees with the same contents always
/// produce byte-identical blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `entry.name`, keeping entries
    /// sorted by name.
    pub fn insert(&mut self, entry: TreeEntry) -> OriResult<()> {
        if entry.name.is_empty() || entry.name.contains('/') {
            return Err(OriError::corruption(format!(
                "invalid tree entry name {:?}",
                entry.name
            )));
        }
        match self.entries.binary_search_by(|e| e.name.as_str().cmp(entry.name.as_str())) {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.entries.len() as u32);
        for entry in &self.entries {
            w.write_pstr(&entry.name);
            w.write_u8(entry.kind.to_u8());
            w.write_hash(&entry.child_id);
            w.write_pstr_bytes(&entry.attrs.encode());
        }
        w.into_bytes()
    }

    pub fn from_blob(bytes: &[u8]) -> OriResult<Self> {
        let mut r = Reader::new(bytes);
        let count = r.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = r.read_pstr()?;
            let kind = EntryKind::from_u8(r.read_u8()?)?;
            let child_id = r.read_hash()?;
            let attrs_bytes = r.read_pstr_bytes()?;
            let attrs = AttrMap::decode(&attrs_bytes)?;
            entries.push(TreeEntry {
                name,
                kind,
                child_id,
                attrs,
            });
        }
        Ok(Self { entries })
    }
}
