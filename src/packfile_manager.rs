//! Tracks the set of packfiles under `<R>/objs/` and the currently open one.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::error::IoResultExt as _;
use crate::error::OriResult;
use crate::packfile::Packfile;

pub struct PackfileManager {
    dir: PathBuf,
    sealed_ids: BTreeSet<u32>,
    current: Packfile,
}

impl PackfileManager {
    /// Scans `dir` for existing `pack.*` files and opens (or creates) the
    /// current writable packfile, which is the one with the highest id.
    pub fn open(dir: &Path) -> OriResult<Self> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(dir).with_path(dir)? {
            let entry = entry.with_path(dir)?;
            if let Some(id) = parse_packfile_id(&entry.file_name().to_string_lossy()) {
                ids.insert(id);
            }
        }

        let current = match ids.iter().next_back().copied() {
            Some(id) => Packfile::open(dir, id)?,
            None => {
                ids.insert(0);
                Packfile::create(dir, 0)?
            }
        };
        let current_id = current.id;
        ids.remove(&current_id);

        Ok(Self {
            dir: dir.to_owned(),
            sealed_ids: ids,
            current,
        })
    }

    pub fn current_mut(&mut self) -> &mut Packfile {
        &mut self.current
    }

    pub fn current_id(&self) -> u32 {
        self.current.id
    }

    /// Seals the current packfile if it has grown past its soft cap and
    /// allocates a fresh one. Must be called between transactions, never
    /// mid-transaction.
    pub fn roll_if_full(&mut self) -> OriResult<()> {
        if !self.current.is_full()? {
            return Ok(());
        }
        let sealed_id = self.current.id;
        self.sealed_ids.insert(sealed_id);
        let next_id = self.next_id();
        tracing::debug!(sealed_id, next_id, "packfile sealed, rolling over");
        self.current = Packfile::create(&self.dir, next_id)?;
        Ok(())
    }

    fn next_id(&self) -> u32 {
        let max_sealed = self.sealed_ids.iter().next_back().copied().unwrap_or(0);
        max_sealed.max(self.current.id) + 1
    }

    pub fn open_packfile(&self, id: u32) -> OriResult<Packfile> {
        Packfile::open(&self.dir, id)
    }

    pub fn all_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sealed_ids.iter().copied().collect();
        ids.push(self.current.id);
        ids.sort_unstable();
        ids
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_packfile_id(file_name: &str) -> Option<u32> {
    let hex = file_name.strip_prefix("pack.")?;
    u32::from_str_radix(hex, 16).ok()
}
