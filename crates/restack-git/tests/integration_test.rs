use std::io::Read;
use std::path::Path;
use std::time::Duration;

use bstr::ByteSlice;
use tempfile::TempDir;

use restack_git::{
    CancellationToken, GitCli, GitError, Hash, ListTreeOptions, Mode, ObjectKind, ObjectStore,
    TreeEntry,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

fn git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).unwrap().trim().to_owned()
}

fn setup_repo() -> (TempDir, GitCli) {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test User"]);
    let store = GitCli::new(dir.path());
    (dir, store)
}

/// A tree `{ README.md, src/{lib.rs, bin/main.rs} }`.
fn sample_tree(store: &GitCli) -> Hash {
    let readme = store.write_blob_bytes(b"# readme\n").unwrap();
    let lib = store.write_blob_bytes(b"pub fn f() {}\n").unwrap();
    let main = store.write_blob_bytes(b"fn main() {}\n").unwrap();
    let (bin, _) = store
        .make_tree_from(&[TreeEntry::new_blob("main.rs", Mode::Executable, main)])
        .unwrap();
    let (src, _) = store
        .make_tree_from(&[
            TreeEntry::new_blob("lib.rs", Mode::Regular, lib),
            TreeEntry::new_tree("bin", bin),
        ])
        .unwrap();
    let (root, _) = store
        .make_tree_from(&[
            TreeEntry::new_tree("src", src),
            TreeEntry::new_blob("README.md", Mode::Regular, readme),
        ])
        .unwrap();
    root
}

// ===========================================================================
// Blobs
// ===========================================================================

#[test]
fn blob_roundtrip() {
    let (_dir, store) = setup_repo();
    let hash = store.write_blob_bytes(b"some blob content").unwrap();
    let mut out = Vec::new();
    store.read_blob(hash, &mut out).unwrap();
    assert_eq!(out, b"some blob content");
}

#[test]
fn blob_hash_matches_git() {
    let (dir, store) = setup_repo();
    let hash = store.write_blob_bytes(b"hello\n").unwrap();
    std::fs::write(dir.path().join("f"), b"hello\n").unwrap();
    assert_eq!(hash.as_str(), git(dir.path(), &["hash-object", "f"]));
}

#[test]
fn read_missing_blob_is_not_found() {
    let (_dir, store) = setup_repo();
    let missing: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
    let err = store.read_blob(missing, &mut Vec::new()).unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

// ===========================================================================
// Trees
// ===========================================================================

#[test]
fn empty_tree_has_well_known_hash() {
    let (_dir, store) = setup_repo();
    let (hash, count) = store.make_tree_from(&[]).unwrap();
    assert_eq!(hash.as_str(), EMPTY_TREE);
    assert_eq!(count, 0);
}

#[test]
fn list_tree_in_store_order() {
    let (_dir, store) = setup_repo();
    let root = sample_tree(&store);
    let entries = store
        .list_tree(root, ListTreeOptions::default())
        .unwrap()
        .collect_entries()
        .unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.to_str().unwrap()).collect();
    assert_eq!(names, ["README.md", "src"]);
    assert_eq!(entries[1].kind, ObjectKind::Tree);
    assert_eq!(entries[1].mode, Mode::Directory);
}

#[test]
fn list_tree_recursive_lists_blobs_with_paths() {
    let (_dir, store) = setup_repo();
    let root = sample_tree(&store);
    let entries = store
        .list_tree(root, ListTreeOptions { recurse: true })
        .unwrap()
        .collect_entries()
        .unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.to_str().unwrap()).collect();
    assert_eq!(names, ["README.md", "src/bin/main.rs", "src/lib.rs"]);
    assert_eq!(entries[1].mode, Mode::Executable);
}

#[test]
fn list_missing_tree_fails_through_listing() {
    let (_dir, store) = setup_repo();
    let missing: Hash = "2222222222222222222222222222222222222222".parse().unwrap();
    let mut listing = store.list_tree(missing, ListTreeOptions::default()).unwrap();
    let err = listing.next().unwrap().unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(listing.next().is_none());
}

#[test]
fn list_tree_can_stop_early() {
    let (_dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let entries: Vec<_> = (0..2000)
        .map(|i| TreeEntry::new_blob(format!("file-{i:05}"), Mode::Regular, blob))
        .collect();
    let (root, count) = store.make_tree_from(&entries).unwrap();
    assert_eq!(count, 2000);

    let mut listing = store.list_tree(root, ListTreeOptions::default()).unwrap();
    assert_eq!(listing.next().unwrap().unwrap().name, "file-00000");
    listing.close().unwrap();
}

#[test]
fn closing_a_cancelled_listing_reports_cancellation() {
    let (_dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let entries: Vec<_> = (0..2000)
        .map(|i| TreeEntry::new_blob(format!("file-{i:05}"), Mode::Regular, blob))
        .collect();
    let (root, _) = store.make_tree_from(&entries).unwrap();

    let token = CancellationToken::new();
    let store = store.with_cancellation(token.clone());
    let mut listing = store.list_tree(root, ListTreeOptions::default()).unwrap();
    listing.next().unwrap().unwrap();
    token.cancel();
    let err = listing.close().unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

#[test]
fn names_that_are_not_utf8_round_trip() {
    let (dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let (tree, _) = store
        .make_tree_from(&[
            TreeEntry::new_blob(&b"caf\xe9"[..], Mode::Regular, blob),
            TreeEntry::new_blob("plain", Mode::Regular, blob),
        ])
        .unwrap();

    let names: Vec<_> = store
        .list_tree(tree, ListTreeOptions::default())
        .unwrap()
        .map(|e| e.unwrap().name)
        .collect();
    assert_eq!(names, [&b"caf\xe9"[..], b"plain"]);
    assert_eq!(store.hash_at(tree.as_str(), b"caf\xe9".as_bstr()).unwrap(), blob);

    // git agrees on the bytes it stored.
    let out = std::process::Command::new("git")
        .args(["ls-tree", "-z", "--name-only", tree.as_str()])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(out.stdout, b"caf\xe9\0plain\0");
}

#[test]
fn make_tree_accepts_unsorted_input() {
    let (_dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let (a, _) = store
        .make_tree_from(&[
            TreeEntry::new_blob("b", Mode::Regular, blob),
            TreeEntry::new_blob("a", Mode::Regular, blob),
        ])
        .unwrap();
    let (b, _) = store
        .make_tree_from(&[
            TreeEntry::new_blob("a", Mode::Regular, blob),
            TreeEntry::new_blob("b", Mode::Regular, blob),
        ])
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn make_tree_rejects_nested_name_without_writing() {
    let (_dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let err = store
        .make_tree_from(&[
            TreeEntry::new_blob("ok", Mode::Regular, blob),
            TreeEntry::new_blob("a/b", Mode::Regular, blob),
        ])
        .unwrap_err();
    assert!(matches!(err, GitError::InvalidEntry { .. }), "{err}");
}

#[test]
fn make_tree_stops_on_input_error() {
    let (_dir, store) = setup_repo();
    let blob = store.write_blob_bytes(b"x").unwrap();
    let mut input = vec![
        Ok(TreeEntry::new_blob("a", Mode::Regular, blob)),
        Err(GitError::InvariantViolation {
            message: "upstream".into(),
        }),
    ]
    .into_iter();
    let err = store.make_tree(&mut input).unwrap_err();
    assert!(matches!(err, GitError::InvariantViolation { .. }), "{err}");
}

// ===========================================================================
// Lookups
// ===========================================================================

#[test]
fn hash_at_resolves_nested_paths() {
    let (dir, store) = setup_repo();
    let root = sample_tree(&store);
    let src = store.hash_at(root.as_str(), "src".into()).unwrap();
    assert_eq!(
        src.as_str(),
        git(dir.path(), &["rev-parse", &format!("{root}:src")])
    );
    assert_eq!(store.hash_at(root.as_str(), "".into()).unwrap(), root);
    store.hash_at(root.as_str(), "src/bin/main.rs".into()).unwrap();
}

#[test]
fn hash_at_missing_path_is_not_found() {
    let (_dir, store) = setup_repo();
    let root = sample_tree(&store);
    let err = store.hash_at(root.as_str(), "nope/deeper".into()).unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[test]
fn peel_commit_to_tree() {
    let (dir, store) = setup_repo();
    let root = sample_tree(&store);
    let commit = git(dir.path(), &["commit-tree", root.as_str(), "-m", "init"]);
    assert_eq!(store.peel_to_tree(&commit).unwrap(), root);
    assert_eq!(store.peel_to_tree(root.as_str()).unwrap(), root);
    assert!(store.peel_to_tree("no-such-branch").unwrap_err().is_not_found());
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[test]
fn cancelled_handle_never_spawns() {
    let (_dir, store) = setup_repo();
    let token = CancellationToken::new();
    token.cancel();
    let err = store
        .with_cancellation(token)
        .write_blob_bytes(b"x")
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

/// Cancels its token on first read, then stalls long enough for the
/// watcher to kill git.
struct CancellingReader {
    token: CancellationToken,
    sent: bool,
}

impl Read for CancellingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.sent {
            return Ok(0);
        }
        self.sent = true;
        self.token.cancel();
        std::thread::sleep(Duration::from_millis(200));
        buf[0] = b'x';
        Ok(1)
    }
}

#[test]
fn cancel_mid_call_kills_git() {
    let (_dir, store) = setup_repo();
    let token = CancellationToken::new();
    let store = store.with_cancellation(token.clone());
    let mut reader = CancellingReader { token, sent: false };
    let err = store.write_blob(&mut reader).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

#[test]
fn other_handles_unaffected_by_cancellation() {
    let (_dir, store) = setup_repo();
    let token = CancellationToken::new();
    let cancelled = store.with_cancellation(token.clone());
    token.cancel();
    assert!(cancelled.write_blob_bytes(b"x").is_err());
    store.write_blob_bytes(b"x").unwrap();
}
