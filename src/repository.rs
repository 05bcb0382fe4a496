//! The top-level orchestrator: branch refs, HEAD, snapshots, remotes, the
//! whole-repository lock, and the higher-level commit/pull/graft/gc
//! operations built on [`ObjectStore`] and [`MetadataLog`].
//!
//! Every mutating entry point acquires [`Repository::lock`] first. Reads
//! (`get`, `list_branches`, ...) need no lock: packfiles are append-only and
//! the index is swapped in atomically, so a reader always sees a consistent
//! snapshot of some past state.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::codec::Codec;
use crate::commit::Commit;
use crate::commit::GraftRecord;
use crate::config::RemoteConfig;
use crate::config::RepoConfig;
use crate::error::IoResultExt as _;
use crate::error::OriError;
use crate::error::OriResult;
use crate::hash::HashedId;
use crate::hash::HASH_LEN;
use crate::large_blob::LargeBlob;
use crate::metadata::MetadataLog;
use crate::metadata::Transaction as MetadataTransaction;
use crate::object_store::ObjectStore;
use crate::packfile::ObjectInfo;
use crate::packfile::ObjectType;
use crate::signature::RepositoryKeyring;
use crate::signature::SigningKey;
use crate::signature::Verification;
use crate::transfer::CancellationToken;
use crate::transfer::RemoteChannel;
use crate::tree::EntryKind;
use crate::tree::Tree;

pub const VERSION_STRING: &str = "ORI1.0";
pub const DEFAULT_BRANCH: &str = "default";

/// Caller-supplied overrides for [`Repository::commit_from_tree`]. Any
/// field left `None` falls back to the default described in that method's
/// documentation.
#[derive(Debug, Clone, Default)]
pub struct CommitDraft {
    pub user: Option<String>,
    pub message: Option<String>,
    pub time: Option<u64>,
    /// Explicit parent list; `None` means "current HEAD, or none at all on
    /// an empty branch".
    pub parents: Option<Vec<HashedId>>,
    pub snapshot_name: Option<String>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn default_user() -> String {
    let real = whoami::realname();
    if real.trim().is_empty() { whoami::username() } else { real }
}

#[cfg(unix)]
fn create_lock_symlink(target: &str, link_path: &Path) -> io::Result<()> {
    rustix::fs::symlink(target, link_path).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn create_lock_symlink(_target: &str, link_path: &Path) -> io::Result<()> {
    OpenOptions::new().create_new(true).write(true).open(link_path)?;
    Ok(())
}

/// Holds the repository's exclusive lock until dropped.
pub struct RepoLock {
    path: PathBuf,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The `name -> commit id` snapshot table, a compact append-only log
/// structured exactly like [`crate::index::Index`]'s own log (a short fixed
/// header per record, truncate-to-last-valid-record recovery on open).
struct SnapshotLog {
    path: PathBuf,
    log: File,
    map: BTreeMap<String, HashedId>,
}

fn write_snapshot_record(out: &mut impl io::Write, name: &str, id: &HashedId) -> io::Result<()> {
    let name_bytes = name.as_bytes();
    let len: u32 = name_bytes.len().try_into().expect("snapshot name longer than u32::MAX bytes");
    out.write_all(&len.to_le_bytes())?;
    out.write_all(name_bytes)?;
    out.write_all(id.as_bytes())?;
    Ok(())
}

fn read_snapshot_record(input: &mut impl io::Read) -> io::Result<Option<(String, HashedId)>> {
    let mut len_bytes = [0u8; 4];
    match input.read(&mut len_bytes) {
        Ok(0) => return Ok(None),
        Ok(n) if n < 4 => {
            input.read_exact(&mut len_bytes[n..])?;
        }
        Ok(_) => {}
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut name_bytes = vec![0u8; len];
    input.read_exact(&mut name_bytes)?;
    let name = String::from_utf8(name_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut id_bytes = [0u8; HASH_LEN];
    input.read_exact(&mut id_bytes)?;
    Ok(Some((name, HashedId::from_bytes(id_bytes))))
}

impl SnapshotLog {
    fn open(path: &Path) -> OriResult<Self> {
        let mut log = OpenOptions::new().create(true).read(true).append(true).open(path).with_path(path)?;
        let mut buf = Vec::new();
        log.read_to_end(&mut buf).with_path(path)?;
        let mut map = BTreeMap::new();
        let mut cursor = buf.as_slice();
        let mut valid_len = 0usize;
        loop {
            let before = cursor.len();
            match read_snapshot_record(&mut cursor) {
                Ok(Some((name, id))) => {
                    valid_len += before - cursor.len();
                    map.insert(name, id);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(path = %path.display(), valid_len, "truncated snapshot tail, recovering");
                    break;
                }
            }
        }
        if valid_len < buf.len() {
            log.set_len(valid_len as u64).with_path(path)?;
        }
        Ok(Self { path: path.to_owned(), log, map })
    }

    fn add(&mut self, name: &str, id: HashedId) -> OriResult<()> {
        if self.map.contains_key(name) {
            return Err(OriError::conflict(format!("snapshot {name:?} already exists")));
        }
        write_snapshot_record(&mut self.log, name, &id).with_path(&self.path)?;
        self.log.sync_data().with_path(&self.path)?;
        self.map.insert(name.to_owned(), id);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<HashedId> {
        self.map.get(name).copied()
    }
}

/// Owns the object store, metadata log, snapshot table, and repository
/// identity rooted at a single directory `<R>`. See `# 6. EXTERNAL
/// INTERFACES` for the on-disk layout this type maintains.
pub struct Repository {
    root: PathBuf,
    id: Uuid,
    config: RepoConfig,
    store: ObjectStore,
    metadata: MetadataLog,
    snapshots: SnapshotLog,
}

impl Repository {
    fn heads_dir(&self) -> PathBuf {
        self.root.join("refs").join("heads")
    }

    fn remotes_dir(&self) -> PathBuf {
        self.root.join("refs").join("remotes")
    }

    fn head_path(&self) -> PathBuf {
        self.root.join("HEAD")
    }

    fn id_path(&self) -> PathBuf {
        self.root.join("id")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Scaffolds a fresh repository at `root`, which must not already
    /// contain one.
    #[tracing::instrument(skip_all, fields(root = %root.display()))]
    pub fn init(root: &Path) -> OriResult<Self> {
        create_dir(root)?;
        create_dir(&root.join("refs"))?;
        create_dir(&root.join("refs").join("heads"))?;
        create_dir(&root.join("refs").join("remotes"))?;
        create_dir(&root.join("tmp"))?;

        let id = Uuid::new_v4();
        fs::write(root.join("id"), id.to_string()).with_path(&root.join("id"))?;
        fs::write(root.join("version"), VERSION_STRING).with_path(&root.join("version"))?;

        let config = RepoConfig::default();

        let store = ObjectStore::open(&root.join("objs"), &root.join("index"))?;
        let metadata = MetadataLog::open(&root.join("metadata"))?;
        let snapshots = SnapshotLog::open(&root.join("snapshots"))?;

        let mut repo = Self { root: root.to_owned(), id, config, store, metadata, snapshots };
        repo.write_branch_tip(DEFAULT_BRANCH, HashedId::EMPTY)?;
        repo.write_head(DEFAULT_BRANCH)?;
        tracing::info!(id = %id, root = %root.display(), "repository initialized");
        Ok(repo)
    }

    /// Opens a previously initialized repository, replaying its index and
    /// metadata logs and clearing stale scratch files under `<R>/tmp/`.
    #[tracing::instrument(skip_all, fields(root = %root.display()))]
    pub fn open(root: &Path) -> OriResult<Self> {
        let id_path = root.join("id");
        let id_text = fs::read_to_string(&id_path).with_path(&id_path)?;
        let id = Uuid::parse_str(id_text.trim()).map_err(|e| OriError::corruption(format!("invalid repository id: {e}")))?;

        let version_path = root.join("version");
        let version = fs::read_to_string(&version_path).with_path(&version_path)?;
        if version != VERSION_STRING {
            tracing::warn!(found = %version, expected = VERSION_STRING, "repository version marker mismatch");
        }

        let config = RepoConfig::load_or_default(&root.join("config.toml"))?;
        let store = ObjectStore::open(&root.join("objs"), &root.join("index"))?;
        let metadata = MetadataLog::open(&root.join("metadata"))?;
        let snapshots = SnapshotLog::open(&root.join("snapshots"))?;

        let tmp_dir = root.join("tmp");
        if tmp_dir.exists() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }
        create_dir(&tmp_dir)?;

        Ok(Self { root: root.to_owned(), id, config, store, metadata, snapshots })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    pub fn metadata(&self) -> &MetadataLog {
        &self.metadata
    }

    /// Acquires the cross-process exclusive lock by creating `<R>/lock` as
    /// a symlink. Creation is atomic: a second locker's `symlink()` fails
    /// with `AlreadyExists`, surfaced here as `Conflict`. The returned guard
    /// releases the lock when dropped, including on an error unwind.
    pub fn lock(&self) -> OriResult<RepoLock> {
        let path = self.lock_path();
        tracing::debug!(path = %path.display(), "acquiring repository lock");
        match create_lock_symlink("id", &path) {
            Ok(()) => Ok(RepoLock { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(path = %path.display(), "repository lock already held");
                Err(OriError::conflict(format!("repository already locked at {}", path.display())))
            }
            Err(e) => Err(OriError::Io { path, source: e }),
        }
    }

    // ---- branches and HEAD ----------------------------------------------

    fn write_branch_tip(&self, name: &str, id: HashedId) -> OriResult<()> {
        let path = self.heads_dir().join(name);
        let dir = self.heads_dir();
        let mut temp = NamedTempFile::new_in(&dir).with_path(&dir)?;
        writeln!(temp.as_file_mut(), "{}", id.hex()).with_path(&path)?;
        crate::file_util::persist_temp_file(temp, &path).with_path(&path)?;
        Ok(())
    }

    fn write_head(&self, name: &str) -> OriResult<()> {
        let path = self.head_path();
        let mut temp = NamedTempFile::new_in(&self.root).with_path(&self.root)?;
        temp.as_file_mut().write_all(name.as_bytes()).with_path(&path)?;
        crate::file_util::persist_temp_file(temp, &path).with_path(&path)?;
        Ok(())
    }

    pub fn current_branch(&self) -> OriResult<String> {
        let path = self.head_path();
        let text = fs::read_to_string(&path).with_path(&path)?;
        Ok(text.trim_end().to_owned())
    }

    /// Switches HEAD to `name`, creating the branch (seeded from the
    /// current HEAD's tip) if it does not already exist.
    pub fn set_branch(&mut self, name: &str) -> OriResult<()> {
        let path = self.heads_dir().join(name);
        if !path.exists() {
            let seed = self.head().unwrap_or(HashedId::EMPTY);
            self.write_branch_tip(name, seed)?;
        }
        self.write_head(name)
    }

    pub fn branch_tip(&self, name: &str) -> OriResult<HashedId> {
        let path = self.heads_dir().join(name);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                OriError::BranchNotFound { name: name.to_owned() }
            } else {
                OriError::Io { path: path.clone(), source: e }
            }
        })?;
        HashedId::from_hex(text.trim_end())
    }

    pub fn all_branch_tips(&self) -> OriResult<BTreeMap<String, HashedId>> {
        let dir = self.heads_dir();
        let mut out = BTreeMap::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            if !entry.file_type().with_path(&dir)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let tip = self.branch_tip(&name)?;
            out.insert(name, tip);
        }
        Ok(out)
    }

    pub fn list_branches(&self) -> OriResult<Vec<String>> {
        Ok(self.all_branch_tips()?.into_keys().collect())
    }

    pub fn head(&self) -> OriResult<HashedId> {
        self.branch_tip(&self.current_branch()?)
    }

    pub fn update_head(&mut self, commit_id: HashedId) -> OriResult<()> {
        let branch = self.current_branch()?;
        self.write_branch_tip(&branch, commit_id)
    }

    // ---- remotes ----------------------------------------------------------

    pub fn add_remote(&self, name: &str, remote: &RemoteConfig) -> OriResult<()> {
        remote.save(&self.remotes_dir().join(name))
    }

    pub fn get_remote(&self, name: &str) -> OriResult<RemoteConfig> {
        RemoteConfig::load(&self.remotes_dir().join(name))
    }

    pub fn list_remotes(&self) -> OriResult<Vec<String>> {
        use itertools::Itertools as _;
        let dir = self.remotes_dir();
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out.into_iter().sorted().collect())
    }

    // ---- snapshots ----------------------------------------------------------

    pub fn add_snapshot(&mut self, name: &str, commit_id: HashedId) -> OriResult<()> {
        self.snapshots.add(name, commit_id)
    }

    pub fn get_snapshot(&self, name: &str) -> Option<HashedId> {
        self.snapshots.get(name)
    }

    pub fn list_snapshots(&self) -> Vec<String> {
        self.snapshots.map.keys().cloned().collect()
    }

    // ---- objects ----------------------------------------------------------

    /// The locked entry point for adding a standalone object; every mutator
    /// in this module (`addObject`, `commit`, `pull`, `gc`, `purge`) needs
    /// the repository lock, not just the in-process object store.
    pub fn add_object(&mut self, object_type: ObjectType, canonical_blob: &[u8], codec: Codec) -> OriResult<HashedId> {
        let _lock = self.lock()?;
        self.store.add(object_type, canonical_blob, codec)
    }

    // ---- commit creation and backref bookkeeping --------------------------

    /// Creates a commit pointing at `tree_id`, applying `draft`'s overrides
    /// (or: `user` defaults to a whoami-derived identity, `message` to "No
    /// message.", `time` to the current time, and `parents` to `(HEAD)` or
    /// none on an empty branch), increments backrefs for everything newly
    /// reachable from it, advances HEAD, and optionally records a snapshot
    /// name. Returns the new commit's id.
    #[tracing::instrument(skip(self, draft))]
    pub fn commit_from_tree(&mut self, tree_id: HashedId, draft: CommitDraft) -> OriResult<HashedId> {
        let _lock = self.lock()?;

        if self.store.info(&tree_id)?.object_type != ObjectType::Tree {
            return Err(OriError::corruption("commit tree must reference an existing Tree object"));
        }

        let parents = match draft.parents {
            Some(parents) => parents,
            None => {
                let head = self.head()?;
                if head.is_empty() { Vec::new() } else { vec![head] }
            }
        };
        for parent in &parents {
            if self.store.info(parent)?.object_type != ObjectType::Commit {
                return Err(OriError::corruption("commit parent must reference an existing Commit object"));
            }
        }

        let mut commit = Commit::new(tree_id, parents);
        commit.user = draft.user.unwrap_or_else(default_user);
        commit.time = draft.time.unwrap_or_else(now_unix);
        commit.message = draft.message.filter(|m| !m.is_empty()).unwrap_or_else(|| "No message.".to_owned());
        if let Some(name) = &draft.snapshot_name {
            commit.snapshot_name = name.clone();
        }

        let commit_id = self.store.add(ObjectType::Commit, &commit.preimage(), Codec::None)?;

        let mut tx = MetadataLog::begin();
        self.add_commit_backrefs(&commit, &mut tx)?;
        self.metadata.commit(tx)?;

        self.update_head(commit_id)?;
        if let Some(name) = &draft.snapshot_name {
            self.snapshots.add(name, commit_id)?;
        }

        tracing::info!(commit = %commit_id, "commit created");
        Ok(commit_id)
    }

    /// Increments backrefs for `commit`'s parents and tree. Recurses into
    /// the tree only if its refcount, before this transaction, was zero:
    /// a subtree already referenced elsewhere is already fully accounted
    /// for.
    fn add_commit_backrefs(&mut self, commit: &Commit, tx: &mut MetadataTransaction) -> OriResult<()> {
        for parent in &commit.parents {
            tx.add_ref_delta(*parent, 1);
        }
        tx.add_ref_delta(commit.tree, 1);
        if self.metadata.get_refcount(&commit.tree) == 0 {
            let tree_obj = self.store.get(&commit.tree)?;
            let tree = Tree::from_blob(&tree_obj.payload()?)?;
            self.add_tree_backrefs(&tree, tx)?;
        }
        Ok(())
    }

    fn add_tree_backrefs(&mut self, tree: &Tree, tx: &mut MetadataTransaction) -> OriResult<()> {
        for entry in tree.entries() {
            tx.add_ref_delta(entry.child_id, 1);
            if self.metadata.get_refcount(&entry.child_id) != 0 {
                continue;
            }
            match entry.kind {
                EntryKind::Tree => {
                    let obj = self.store.get(&entry.child_id)?;
                    let subtree = Tree::from_blob(&obj.payload()?)?;
                    self.add_tree_backrefs(&subtree, tx)?;
                }
                EntryKind::LargeBlob => {
                    let obj = self.store.get(&entry.child_id)?;
                    let large_blob = LargeBlob::from_blob(&obj.payload()?)?;
                    for (_, _, chunk_id) in large_blob.parts() {
                        tx.add_ref_delta(*chunk_id, 1);
                    }
                }
                EntryKind::Blob => {}
            }
        }
        Ok(())
    }

    /// Recomputes every object's refcount from scratch by walking every
    /// `Commit` in the store and its full tree/largeblob closure, ignoring
    /// whatever the metadata log currently says. Used to verify or repair
    /// the incremental bookkeeping `commit_from_tree`/`pull` perform.
    #[tracing::instrument(skip(self))]
    pub fn recompute_ref_counts(&mut self) -> OriResult<std::collections::HashMap<HashedId, i64>> {
        let mut counts = std::collections::HashMap::new();
        let mut visited: HashSet<HashedId> = HashSet::new();

        let commit_ids: Vec<HashedId> =
            self.store.list().filter(|info| info.object_type == ObjectType::Commit).map(|info| info.id).collect();

        for commit_id in commit_ids {
            let obj = self.store.get(&commit_id)?;
            let commit = Commit::from_blob(&obj.payload()?)?;
            for parent in &commit.parents {
                *counts.entry(*parent).or_insert(0) += 1;
            }
            *counts.entry(commit.tree).or_insert(0) += 1;
            if visited.insert(commit.tree) {
                let tree_obj = self.store.get(&commit.tree)?;
                let tree = Tree::from_blob(&tree_obj.payload()?)?;
                self.recompute_tree_counts(&tree, &mut counts, &mut visited)?;
            }
        }
        Ok(counts)
    }

    fn recompute_tree_counts(
        &mut self,
        tree: &Tree,
        counts: &mut std::collections::HashMap<HashedId, i64>,
        visited: &mut HashSet<HashedId>,
    ) -> OriResult<()> {
        for entry in tree.entries() {
            *counts.entry(entry.child_id).or_insert(0) += 1;
            if !visited.insert(entry.child_id) {
                continue;
            }
            match entry.kind {
                EntryKind::Tree => {
                    let obj = self.store.get(&entry.child_id)?;
                    let subtree = Tree::from_blob(&obj.payload()?)?;
                    self.recompute_tree_counts(&subtree, counts, visited)?;
                }
                EntryKind::LargeBlob => {
                    let obj = self.store.get(&entry.child_id)?;
                    let large_blob = LargeBlob::from_blob(&obj.payload()?)?;
                    for (_, _, chunk_id) in large_blob.parts() {
                        *counts.entry(*chunk_id).or_insert(0) += 1;
                    }
                }
                EntryKind::Blob => {}
            }
        }
        Ok(())
    }

    /// Recomputes refcounts from scratch and persists the result, replacing
    /// whatever the incremental log bookkeeping currently holds.
    pub fn rebuild_ref_counts(&mut self) -> OriResult<()> {
        let counts = self.recompute_ref_counts()?;
        self.metadata.rewrite(Some(&counts))
    }

    // ---- purge and gc -------------------------------------------------------

    /// The closure of `tree_id` and everything reachable from it through
    /// nested trees, including a `LargeBlob` entry's own chunk ids: a graft
    /// or repack must copy every object a tree transitively depends on, not
    /// just the index objects it names directly.
    fn subtree_objects(&mut self, tree_id: &HashedId) -> OriResult<HashSet<HashedId>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(*tree_id);
        queue.push_back(*tree_id);
        while let Some(id) = queue.pop_front() {
            let obj = self.store.get(&id)?;
            let tree = Tree::from_blob(&obj.payload()?)?;
            for entry in tree.entries() {
                if !seen.insert(entry.child_id) {
                    continue;
                }
                match entry.kind {
                    EntryKind::Tree => queue.push_back(entry.child_id),
                    EntryKind::LargeBlob => {
                        let blob_obj = self.store.get(&entry.child_id)?;
                        let large_blob = LargeBlob::from_blob(&blob_obj.payload()?)?;
                        for (_, _, chunk_id) in large_blob.parts() {
                            seen.insert(*chunk_id);
                        }
                    }
                    EntryKind::Blob => {}
                }
            }
        }
        Ok(seen)
    }

    /// Decrements backrefs for `commit`'s tree, recursing into the tree
    /// (and a `LargeBlob` entry's chunks) only when the object's refcount,
    /// before this transaction, was exactly 1: this decrement is what
    /// drives it to zero, so whatever it alone was keeping alive must be
    /// decremented too. A subtree still held alive by another reference
    /// after this decrement is left untouched, along with everything below
    /// it. The symmetric inverse of [`Self::add_commit_backrefs`].
    fn remove_commit_backrefs(
        &mut self,
        commit: &Commit,
        tx: &mut MetadataTransaction,
        touched: &mut HashSet<HashedId>,
    ) -> OriResult<()> {
        tx.add_ref_delta(commit.tree, -1);
        touched.insert(commit.tree);
        if self.metadata.get_refcount(&commit.tree) == 1 {
            let tree_obj = self.store.get(&commit.tree)?;
            let tree = Tree::from_blob(&tree_obj.payload()?)?;
            self.remove_tree_backrefs(&tree, tx, touched)?;
        }
        Ok(())
    }

    fn remove_tree_backrefs(
        &mut self,
        tree: &Tree,
        tx: &mut MetadataTransaction,
        touched: &mut HashSet<HashedId>,
    ) -> OriResult<()> {
        for entry in tree.entries() {
            tx.add_ref_delta(entry.child_id, -1);
            touched.insert(entry.child_id);
            if self.metadata.get_refcount(&entry.child_id) != 1 {
                continue;
            }
            match entry.kind {
                EntryKind::Tree => {
                    let obj = self.store.get(&entry.child_id)?;
                    let subtree = Tree::from_blob(&obj.payload()?)?;
                    self.remove_tree_backrefs(&subtree, tx, touched)?;
                }
                EntryKind::LargeBlob => {
                    let obj = self.store.get(&entry.child_id)?;
                    let large_blob = LargeBlob::from_blob(&obj.payload()?)?;
                    for (_, _, chunk_id) in large_blob.parts() {
                        tx.add_ref_delta(*chunk_id, -1);
                        touched.insert(*chunk_id);
                    }
                }
                EntryKind::Blob => {}
            }
        }
        Ok(())
    }

    /// Purges `commit_id`'s own object unconditionally (it is not reachable
    /// after this call), decrements the refcount of every object in its
    /// tree's closure that this commit alone was keeping alive, and purges
    /// any of those that reach zero. Refuses to purge a commit that is any
    /// branch's current tip.
    #[tracing::instrument(skip(self))]
    pub fn purge_commit(&mut self, commit_id: &HashedId) -> OriResult<()> {
        let _lock = self.lock()?;

        for (name, tip) in self.all_branch_tips()? {
            if tip == *commit_id {
                return Err(OriError::conflict(format!("cannot purge branch {name:?}'s tip")));
            }
        }

        let commit_obj = self.store.get(commit_id)?;
        let commit = Commit::from_blob(&commit_obj.payload()?)?;

        let mut tx = MetadataLog::begin();
        let mut touched = HashSet::new();
        self.remove_commit_backrefs(&commit, &mut tx, &mut touched)?;
        tx.add_commit_status(*commit_id, "purging");
        self.metadata.commit(tx)?;

        for id in &touched {
            if self.metadata.get_refcount(id) <= 0 {
                self.store.purge(id)?;
            }
        }

        self.store.purge(commit_id)?;

        let mut tx = MetadataLog::begin();
        tx.add_commit_status(*commit_id, "purged");
        self.metadata.commit(tx)?;

        tracing::info!(commit = %commit_id, "commit purged");
        Ok(())
    }

    /// The full transitive closure reachable from every branch tip and
    /// every snapshot: commits, their parents and trees, nested trees and
    /// blobs, and a `LargeBlob`'s chunks, since gc must not reclaim a chunk
    /// a live `LargeBlob` still depends on.
    fn reachable_objects(&mut self) -> OriResult<HashSet<HashedId>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for tip in self.all_branch_tips()?.into_values() {
            if !tip.is_empty() && seen.insert(tip) {
                queue.push_back(tip);
            }
        }
        for snapshot in self.snapshots.map.values().copied().collect::<Vec<_>>() {
            if seen.insert(snapshot) {
                queue.push_back(snapshot);
            }
        }

        while let Some(id) = queue.pop_front() {
            if !self.store.has(&id) {
                continue;
            }
            match self.store.info(&id)?.object_type {
                ObjectType::Commit => {
                    let obj = self.store.get(&id)?;
                    let commit = Commit::from_blob(&obj.payload()?)?;
                    for parent in &commit.parents {
                        if !parent.is_empty() && seen.insert(*parent) {
                            queue.push_back(*parent);
                        }
                    }
                    if !commit.tree.is_empty() && seen.insert(commit.tree) {
                        queue.push_back(commit.tree);
                    }
                }
                ObjectType::Tree => {
                    let obj = self.store.get(&id)?;
                    let tree = Tree::from_blob(&obj.payload()?)?;
                    for entry in tree.entries() {
                        if seen.insert(entry.child_id) {
                            queue.push_back(entry.child_id);
                        }
                    }
                }
                ObjectType::LargeBlob => {
                    let obj = self.store.get(&id)?;
                    let large_blob = LargeBlob::from_blob(&obj.payload()?)?;
                    for (_, _, chunk_id) in large_blob.parts() {
                        if seen.insert(*chunk_id) {
                            queue.push_back(*chunk_id);
                        }
                    }
                }
                ObjectType::Blob | ObjectType::Purged => {}
            }
        }
        Ok(seen)
    }

    /// (a) Rewrites the index from its in-memory map. (b) Rewrites the
    /// metadata log. (c) Purges every object with refcount 0 that is not
    /// reachable from any branch tip or snapshot. (d) Repacks packfiles,
    /// reclaiming the space purge zeroed but never shrank. Checks
    /// `cancel` between purges and skips the repack phase if cancelled
    /// partway through, leaving the next `gc()` to finish the job.
    #[tracing::instrument(skip(self, cancel))]
    pub fn gc(&mut self, cancel: &CancellationToken) -> OriResult<()> {
        let _lock = self.lock()?;

        self.store.index_mut().rewrite()?;
        self.metadata.rewrite(None)?;

        let reachable = self.reachable_objects()?;
        let candidates: Vec<HashedId> = self
            .store
            .list()
            .filter(|info| info.object_type != ObjectType::Purged)
            .filter(|info| self.metadata.get_refcount(&info.id) <= 0 && !reachable.contains(&info.id))
            .map(|info| info.id)
            .collect();

        let mut cancelled = false;
        for id in candidates {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.store.purge(&id)?;
        }

        if cancelled {
            tracing::warn!("gc cancelled before repack, storage not yet reclaimed");
            return Ok(());
        }

        self.store.repack()?;
        tracing::info!("gc complete");
        Ok(())
    }

    // ---- graft --------------------------------------------------------------

    /// Copies `source_commit_id`'s full tree closure from `source` into
    /// this repository (skipping objects already present, never
    /// recompressing), then creates a new commit over the copied tree with
    /// a [`GraftRecord`] naming where it came from. Does not touch
    /// `source` and does not require its lock.
    #[tracing::instrument(skip(self, source))]
    pub fn graft(&mut self, source: &mut Repository, source_commit_id: HashedId, dest_path: &str) -> OriResult<HashedId> {
        let _lock = self.lock()?;

        let source_commit_obj = source.store.get(&source_commit_id)?;
        let source_commit = Commit::from_blob(&source_commit_obj.payload()?)?;
        let closure = source.subtree_objects(&source_commit.tree)?;

        for id in &closure {
            if self.store.has(id) {
                continue;
            }
            let info = source.store.info(id)?;
            let obj = source.store.get(id)?;
            self.store.add_raw(info, obj.stored_bytes())?;
        }

        let head = self.head()?;
        let parents = if head.is_empty() { Vec::new() } else { vec![head] };
        let mut commit = Commit::new(source_commit.tree, parents);
        commit.user = default_user();
        commit.time = now_unix();
        commit.message = format!("Graft of {source_commit_id} from {}", source.id());
        commit.set_graft(GraftRecord {
            source_repo: source.id().to_string(),
            source_path: dest_path.to_owned(),
            source_commit_id,
        });

        let commit_id = self.store.add(ObjectType::Commit, &commit.preimage(), Codec::None)?;
        let mut tx = MetadataLog::begin();
        self.add_commit_backrefs(&commit, &mut tx)?;
        self.metadata.commit(tx)?;
        self.update_head(commit_id)?;

        tracing::info!(commit = %commit_id, source_commit = %source_commit_id, "graft complete");
        Ok(commit_id)
    }

    // ---- transfer -------------------------------------------------------------

    /// Fetches every object reachable from `remote`'s commits that is not
    /// already local, then recomputes and persists refcounts so the newly
    /// arrived objects are accounted for. Does not advance any branch ref;
    /// the caller decides what, if anything, to do with the fetched
    /// history.
    #[tracing::instrument(skip(self, remote, cancel))]
    pub fn pull(&mut self, remote: &mut impl RemoteChannel, cancel: &CancellationToken) -> OriResult<usize> {
        let _lock = self.lock()?;
        let received = crate::transfer::pull(&mut self.store, remote, cancel)?;
        if received > 0 {
            self.rebuild_ref_counts()?;
        }
        Ok(received)
    }

    // ---- signing --------------------------------------------------------------

    pub fn generate_signing_key(&mut self) -> OriResult<SigningKey> {
        RepositoryKeyring::generate(&mut self.metadata)
    }

    pub fn sign_commit(&self, commit: &mut Commit, key: &SigningKey) {
        crate::signature::sign(commit, key);
    }

    pub fn verify_commit(&self, commit: &Commit, claimed_fingerprint: &str) -> Verification {
        crate::signature::verify(commit, claimed_fingerprint, &self.metadata)
    }
}

fn create_dir(path: &Path) -> OriResult<()> {
    crate::file_util::create_or_reuse_dir(path).map_err(|e| OriError::Io { path: e.path, source: e.error })
}
