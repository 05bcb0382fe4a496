//! Scenario-level integration tests driving [`ori_core::Repository`] through
//! its public API only, the way a FUSE front-end or CLI would.

use ori_core::codec::Codec;
use ori_core::commit::Commit;
use ori_core::large_blob::ChunkingStrategy;
use ori_core::large_blob::LargeBlob;
use ori_core::packfile::ObjectType;
use ori_core::repository::CommitDraft;
use ori_core::repository::Repository;
use ori_core::transfer::CancellationToken;
use ori_core::transfer::LocalChannel;
use ori_core::tree::AttrMap;
use ori_core::tree::EntryKind;
use ori_core::tree::Tree;
use ori_core::tree::TreeEntry;

fn init_repo() -> (tempfile::TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(&dir.path().join("repo")).unwrap();
    (dir, repo)
}

fn single_file_tree(repo: &mut Repository, name: &str, contents: &[u8]) -> ori_core::HashedId {
    let blob_id = repo.add_object(ObjectType::Blob, contents, Codec::None).unwrap();
    let mut tree = Tree::new();
    tree.insert(TreeEntry {
        name: name.to_owned(),
        kind: EntryKind::Blob,
        child_id: blob_id,
        attrs: AttrMap::new(0o644, "user", "group", contents.len() as u64, 0, 0),
    })
    .unwrap();
    repo.add_object(ObjectType::Tree, &tree.to_blob(), Codec::General).unwrap()
}

/// A full write -> commit -> read cycle on a fresh repository, matching
/// spec.md §8's first concrete scenario.
#[test]
fn write_commit_and_read_back() {
    let (_dir, mut repo) = init_repo();

    let tree_id = single_file_tree(&mut repo, "hello.txt", b"hello, ori");
    let commit_id = repo.commit_from_tree(tree_id, CommitDraft::default()).unwrap();

    assert_eq!(repo.head().unwrap(), commit_id);

    let commit_obj = repo.store_mut().get(&commit_id).unwrap();
    let commit = Commit::from_blob(&commit_obj.payload().unwrap()).unwrap();
    assert_eq!(commit.tree, tree_id);

    let tree_obj = repo.store_mut().get(&tree_id).unwrap();
    let tree = Tree::from_blob(&tree_obj.payload().unwrap()).unwrap();
    let entry = tree.get("hello.txt").unwrap();
    let blob_obj = repo.store_mut().get(&entry.child_id).unwrap();
    assert_eq!(blob_obj.payload().unwrap(), b"hello, ori");
}

/// A second commit over a changed tree keeps its parent and advances HEAD,
/// and the first commit's tree stays reachable as history, not a dangling
/// object gc would reclaim.
#[test]
fn second_commit_chains_to_the_first_and_both_trees_stay_reachable() {
    let (_dir, mut repo) = init_repo();

    let tree_a = single_file_tree(&mut repo, "a.txt", b"version one");
    let commit_a = repo.commit_from_tree(tree_a, CommitDraft::default()).unwrap();

    let tree_b = single_file_tree(&mut repo, "a.txt", b"version two");
    let commit_b = repo.commit_from_tree(tree_b, CommitDraft::default()).unwrap();

    let commit_b_obj = repo.store_mut().get(&commit_b).unwrap();
    let commit_b_parsed = Commit::from_blob(&commit_b_obj.payload().unwrap()).unwrap();
    assert_eq!(commit_b_parsed.parents.as_slice(), &[commit_a]);

    repo.gc(&CancellationToken::new()).unwrap();
    assert!(repo.store_mut().has(&commit_a));
    assert!(repo.store_mut().has(&tree_a));
    assert!(repo.store_mut().has(&commit_b));
}

/// Purging a commit that no branch points at reclaims any object that
/// becomes unreferenced, while objects still shared with a live commit
/// survive.
#[test]
fn purge_reclaims_orphaned_commit_but_keeps_shared_objects() {
    let (_dir, mut repo) = init_repo();

    let shared_blob = repo.add_object(ObjectType::Blob, b"shared contents", Codec::None).unwrap();
    let mut tree1 = Tree::new();
    tree1
        .insert(TreeEntry {
            name: "shared.txt".to_owned(),
            kind: EntryKind::Blob,
            child_id: shared_blob,
            attrs: AttrMap::new(0o644, "u", "g", 15, 0, 0),
        })
        .unwrap();
    let tree1_id = repo.add_object(ObjectType::Tree, &tree1.to_blob(), Codec::None).unwrap();
    let commit1 = repo.commit_from_tree(tree1_id, CommitDraft { parents: Some(vec![]), ..Default::default() }).unwrap();

    // Second, throwaway commit shares the same blob via a second tree.
    let mut tree2 = Tree::new();
    tree2
        .insert(TreeEntry {
            name: "shared.txt".to_owned(),
            kind: EntryKind::Blob,
            child_id: shared_blob,
            attrs: AttrMap::new(0o644, "u", "g", 15, 0, 0),
        })
        .unwrap();
    tree2
        .insert(TreeEntry {
            name: "only-here.txt".to_owned(),
            kind: EntryKind::Blob,
            child_id: repo.add_object(ObjectType::Blob, b"only in throwaway commit", Codec::None).unwrap(),
            attrs: AttrMap::new(0o644, "u", "g", 24, 0, 0),
        })
        .unwrap();
    let tree2_id = repo.add_object(ObjectType::Tree, &tree2.to_blob(), Codec::None).unwrap();
    let throwaway = repo.commit_from_tree(tree2_id, CommitDraft { parents: Some(vec![commit1]), ..Default::default() }).unwrap();

    // Move HEAD back so `throwaway` is no branch's tip, then purge it.
    repo.update_head(commit1).unwrap();
    repo.purge_commit(&throwaway).unwrap();

    assert!(repo.store_mut().has(&shared_blob), "blob still referenced by commit1's tree must survive");
    assert!(repo.store_mut().has(&tree1_id));
    assert!(!repo.store_mut().has(&throwaway));
}

/// `graft` copies a commit's full tree closure across repositories without
/// mutating the source, recording provenance on the new commit.
#[test]
fn graft_copies_closure_and_records_provenance() {
    let (_src_dir, mut source) = init_repo();
    let tree_id = single_file_tree(&mut source, "grafted.txt", b"payload from source repo");
    let source_commit = source.commit_from_tree(tree_id, CommitDraft::default()).unwrap();

    let (_dst_dir, mut dest) = init_repo();
    let grafted_commit = dest.graft(&mut source, source_commit, "imported/path").unwrap();

    assert_eq!(dest.head().unwrap(), grafted_commit);
    let grafted_obj = dest.store_mut().get(&grafted_commit).unwrap();
    let grafted = Commit::from_blob(&grafted_obj.payload().unwrap()).unwrap();
    assert!(grafted.is_graft());
    assert_eq!(grafted.tree, tree_id);
    assert!(dest.store_mut().has(&tree_id));

    // Source is untouched: its own HEAD still points at its own commit.
    assert_eq!(source.head().unwrap(), source_commit);
}

/// Pulling from a remote repository fetches its full reachable closure and
/// leaves refcounts consistent with a from-scratch recomputation.
#[test]
fn pull_fetches_closure_and_refcounts_stay_consistent() {
    let (_remote_dir, mut remote) = init_repo();
    let tree_id = single_file_tree(&mut remote, "remote.txt", b"fetched over the wire");
    let remote_commit = remote.commit_from_tree(tree_id, CommitDraft::default()).unwrap();

    let (_local_dir, mut local) = init_repo();
    let remote_commit_ids = vec![remote_commit];
    let mut channel = LocalChannel { store: remote.store_mut(), commit_ids: remote_commit_ids };
    let received = local.pull(&mut channel, &CancellationToken::new()).unwrap();
    assert!(received > 0);

    assert!(local.store_mut().has(&remote_commit));
    assert!(local.store_mut().has(&tree_id));

    let recomputed = local.recompute_ref_counts().unwrap();
    assert_eq!(recomputed.get(&tree_id).copied().unwrap_or(0), 1);
}

/// Signing a commit and verifying it against the repository's own keyring
/// round-trips, and a forged fingerprint is rejected.
#[test]
fn sign_and_verify_round_trip() {
    let (_dir, mut repo) = init_repo();
    let tree_id = single_file_tree(&mut repo, "signed.txt", b"integrity matters");
    let mut commit = Commit::new(tree_id, vec![]);

    let key = repo.generate_signing_key().unwrap();
    repo.sign_commit(&mut commit, &key);
    assert!(commit.has_signature());

    let verdict = repo.verify_commit(&commit, &key.fingerprint());
    assert_eq!(verdict, ori_core::signature::Verification::Valid);

    let forged = repo.verify_commit(&commit, "0000000000000000000000000000000000000000000000000000000000000000");
    assert_ne!(forged, ori_core::signature::Verification::Valid);
}

/// A second attempt to acquire the repository lock while the first guard is
/// still held fails with a conflict, modeling two processes racing to
/// mutate the same repository.
#[test]
fn concurrent_lock_acquisition_conflicts() {
    let (_dir, repo) = init_repo();
    let _first = repo.lock().unwrap();
    let second = repo.lock();
    assert!(second.is_err());
}

/// A large file split into content-defined chunks reconstructs byte-exact,
/// and the resulting `LargeBlob` object is reachable from a commit the same
/// way an ordinary blob is.
#[test]
fn large_blob_round_trips_through_a_commit() {
    let (_dir, mut repo) = init_repo();

    let mut data = Vec::with_capacity(3 * 1024 * 1024);
    for i in 0..data.capacity() {
        data.push((i % 251) as u8);
    }

    let large_blob_id =
        LargeBlob::split(repo.store_mut(), &data, ChunkingStrategy::ContentDefined, Codec::General).unwrap();

    let mut tree = Tree::new();
    tree.insert(TreeEntry {
        name: "big.bin".to_owned(),
        kind: EntryKind::LargeBlob,
        child_id: large_blob_id,
        attrs: AttrMap::new(0o644, "u", "g", data.len() as u64, 0, 0),
    })
    .unwrap();
    let tree_id = repo.add_object(ObjectType::Tree, &tree.to_blob(), Codec::None).unwrap();
    let commit_id = repo.commit_from_tree(tree_id, CommitDraft::default()).unwrap();
    assert_eq!(repo.head().unwrap(), commit_id);

    let reconstructed = LargeBlob::reconstruct(repo.store_mut(), &large_blob_id).unwrap();
    assert_eq!(reconstructed, data);

    repo.gc(&CancellationToken::new()).unwrap();
    assert!(repo.store_mut().has(&large_blob_id));
}
