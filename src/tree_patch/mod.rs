//! Sparse tree editing.
//!
//! [`update_tree`] applies path-keyed blob writes and deletes to an existing
//! tree and returns the new root hash, without reading or rewriting any
//! subtree the edits do not touch.
//!
//! # Algorithm
//!
//! 1. Group edits by containing directory (`""` is the root) and mark every
//!    ancestor of an edited directory as affected: its child hash changes.
//! 2. Order affected directories deepest first, ties broken lexically, so
//!    each subtree is rebuilt before its parent.
//! 3. For each directory: resolve its current hash in the base tree (absent
//!    means empty), list it, merge the listing with the directory's pending
//!    patch, and write the result with `mktree`. An empty result becomes a
//!    delete in the parent instead (pruning); otherwise the new subtree
//!    becomes a write in the parent.
//! 4. The root is always written, even when empty.
//!
//! Git's own ordering for tree entries compares directories as if their
//! names ended in `/`, so listings are re-sorted by plain name before the
//! linear merge. `mktree` restores git order on output.


use std::collections::{BTreeMap, BTreeSet, HashSet};

use bstr::{BString, ByteSlice};
use restack_git::{BlobInfo, GitError, Hash, ListTreeOptions, ObjectStore, TreeEntry};
use tracing::instrument;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Edits to apply to a tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateTreeRequest {
    /// The tree to edit. [`Hash::ZERO`] stands for the empty tree.
    pub base: Hash,
    /// Blobs to place. For the same path, the last write wins.
    pub writes: Vec<BlobInfo>,
    /// Paths to remove. Missing paths are ignored. A path that is also
    /// written keeps the write.
    pub deletes: Vec<BString>,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Apply `request` to its base tree and return the resulting tree hash.
///
/// With no writes and no deletes the base hash is returned as-is, even when
/// it is [`Hash::ZERO`].
///
/// # Errors
///
/// - [`GitError::InvalidEntry`] for a malformed path, or when a written path
///   is also an ancestor directory of another edited path.
/// - [`GitError::InvariantViolation`] if the engine's own bookkeeping goes
///   wrong.
/// - Any store error other than a missing directory, unchanged.
#[instrument(skip_all, fields(base = %request.base, writes = request.writes.len(), deletes = request.deletes.len()))]
pub fn update_tree(store: &dyn ObjectStore, request: &UpdateTreeRequest) -> Result<Hash, GitError> {
    if request.writes.is_empty() && request.deletes.is_empty() {
        return Ok(request.base);
    }

    let mut plan = Plan::new(request)?;
    let order = plan.order();
    let base = (!request.base.is_zero()).then_some(request.base);

    for dir in order {
        let patch = plan.take(&dir)?;
        let existing = match base {
            Some(base) => list_dir(store, base, &dir)?,
            None => Vec::new(),
        };
        let entries = patch.apply(existing);

        if dir.is_empty() {
            let (hash, count) = store.make_tree(&mut entries.into_iter().map(Ok))?;
            tracing::debug!(dir = ".", %hash, entries = count, "rebuilt root");
            plan.finish()?;
            return Ok(hash);
        }

        let (parent, name) = split_path(&dir);
        if entries.is_empty() {
            tracing::debug!(%dir, "pruned empty directory");
            plan.push(parent, Edit::Delete(BString::from(name)))?;
        } else {
            let (hash, count) = store.make_tree(&mut entries.into_iter().map(Ok))?;
            tracing::debug!(%dir, %hash, entries = count, "rebuilt directory");
            plan.push(parent, Edit::Write(TreeEntry::new_tree(name, hash)))?;
        }
    }

    Err(invariant("root directory was never rebuilt".to_owned()))
}

/// Build a tree from scratch out of a flat list of blobs.
///
/// Equivalent to [`update_tree`] against the empty tree, except that an
/// empty list yields the empty tree object rather than [`Hash::ZERO`].
///
/// # Errors
///
/// Same as [`update_tree`].
pub fn make_tree_recursive(store: &dyn ObjectStore, blobs: &[BlobInfo]) -> Result<Hash, GitError> {
    if blobs.is_empty() {
        return store.make_tree_from(&[]).map(|(hash, _)| hash);
    }
    update_tree(
        store,
        &UpdateTreeRequest {
            base: Hash::ZERO,
            writes: blobs.to_vec(),
            deletes: Vec::new(),
        },
    )
}

/// Current entries of `dir` inside `base`, sorted by name. An absent
/// directory is empty; an absent base tree is an error.
fn list_dir(store: &dyn ObjectStore, base: Hash, dir: &[u8]) -> Result<Vec<TreeEntry>, GitError> {
    let hash = match store.hash_at(base.as_str(), dir.as_bstr()) {
        Ok(hash) => hash,
        Err(e) if e.is_not_found() && !dir.is_empty() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut entries = store
        .list_tree(hash, ListTreeOptions::default())?
        .collect_entries()?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

// ---------------------------------------------------------------------------
// DirectoryPatch
// ---------------------------------------------------------------------------

enum Edit {
    Write(TreeEntry),
    Delete(BString),
}

/// Pending edits to the direct children of one directory.
#[derive(Debug, Default)]
struct DirectoryPatch {
    writes: BTreeMap<BString, TreeEntry>,
    deletes: BTreeSet<BString>,
}

impl DirectoryPatch {
    fn push(&mut self, edit: Edit) {
        match edit {
            Edit::Write(entry) => {
                self.writes.insert(entry.name.clone(), entry);
            }
            Edit::Delete(name) => {
                self.deletes.insert(name);
            }
        }
    }

    /// Merge the patch into `existing` (sorted by name). Writes replace or
    /// add entries, deletes drop them, a write beats a delete of the same
    /// name. The result is sorted by name.
    fn apply(self, existing: Vec<TreeEntry>) -> Vec<TreeEntry> {
        let Self { writes, deletes } = self;
        let mut out = Vec::with_capacity(existing.len() + writes.len());
        let mut writes = writes.into_values().peekable();

        for entry in existing {
            while let Some(w) = writes.next_if(|w| w.name < entry.name) {
                out.push(w);
            }
            if let Some(w) = writes.next_if(|w| w.name == entry.name) {
                out.push(w);
            } else if !deletes.contains(&entry.name) {
                out.push(entry);
            }
        }
        out.extend(writes);
        out
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Per-directory patches plus the bookkeeping that guarantees each one is
/// consumed exactly once.
struct Plan {
    patches: BTreeMap<BString, DirectoryPatch>,
    done: HashSet<BString>,
}

impl Plan {
    fn new(request: &UpdateTreeRequest) -> Result<Self, GitError> {
        let mut plan = Self {
            patches: BTreeMap::new(),
            done: HashSet::new(),
        };

        let mut written = HashSet::new();
        let mut dirs_written = HashSet::new();
        for blob in &request.writes {
            let path = normalize(&blob.path)?;
            written.insert(path);
            dirs_written.extend(ancestors(path));
        }
        for path in &written {
            if dirs_written.contains(path) {
                return Err(conflict(path, "written as a file and used as a directory"));
            }
        }

        let deleted = request
            .deletes
            .iter()
            .map(|p| normalize(p))
            .collect::<Result<BTreeSet<_>, _>>()?;
        for &path in &deleted {
            if dirs_written.contains(path) {
                return Err(conflict(path, "deleted but also written beneath"));
            }
            if let Some(dir) = ancestors(path).find(|d| written.contains(d)) {
                return Err(conflict(dir, "written as a file and used as a directory"));
            }
            if ancestors(path).any(|d| deleted.contains(d)) {
                // Removed along with its deleted ancestor.
                continue;
            }
            let (dir, name) = split_path(path);
            plan.seed(dir, Edit::Delete(BString::from(name)));
        }
        for blob in &request.writes {
            let path = normalize(&blob.path)?;
            let (dir, name) = split_path(path);
            let entry = TreeEntry::new_blob(name, blob.mode, blob.hash);
            entry.validate()?;
            plan.seed(dir, Edit::Write(entry));
        }
        Ok(plan)
    }

    /// Record a request edit, marking `dir` and all its ancestors affected.
    fn seed(&mut self, dir: &[u8], edit: Edit) {
        self.patches.entry(BString::from(dir)).or_default().push(edit);
        for ancestor in ancestors_of_dir(dir) {
            self.patches.entry(BString::from(ancestor)).or_default();
        }
    }

    /// Affected directories, deepest first, then lexical.
    fn order(&self) -> Vec<BString> {
        let mut dirs: Vec<BString> = self.patches.keys().cloned().collect();
        dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
        dirs
    }

    fn take(&mut self, dir: &[u8]) -> Result<DirectoryPatch, GitError> {
        let dir = dir.as_bstr();
        self.done.insert(dir.to_owned());
        self.patches
            .remove(dir)
            .ok_or_else(|| invariant(format!("no patch for directory `{dir}`")))
    }

    /// Queue an edit produced by rebuilding a child of `dir`.
    fn push(&mut self, dir: &[u8], edit: Edit) -> Result<(), GitError> {
        let dir = dir.as_bstr();
        if self.done.contains(dir) {
            return Err(invariant(format!(
                "directory `{dir}` was rebuilt before its child"
            )));
        }
        match self.patches.get_mut(dir) {
            Some(patch) => {
                patch.push(edit);
                Ok(())
            }
            None => Err(invariant(format!(
                "directory `{dir}` was not marked affected"
            ))),
        }
    }

    /// Check that every patch was consumed.
    fn finish(&self) -> Result<(), GitError> {
        match self.patches.keys().next() {
            None => Ok(()),
            Some(dir) => Err(invariant(format!(
                "patch for `{dir}` left unapplied"
            ))),
        }
    }
}

fn invariant(message: String) -> GitError {
    tracing::error!(detail = %message, "tree patch bookkeeping failed");
    GitError::InvariantViolation { message }
}

fn conflict(path: &[u8], reason: &str) -> GitError {
    GitError::InvalidEntry {
        name: path.as_bstr().to_string(),
        reason: reason.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

// Paths are raw bytes; only `/` and NUL mean anything to git.

/// Strip leading and trailing slashes and reject empty, `.` or `..`
/// segments.
fn normalize(path: &[u8]) -> Result<&[u8], GitError> {
    let start = path.iter().position(|&b| b != b'/').unwrap_or(path.len());
    let end = path.iter().rposition(|&b| b != b'/').map_or(start, |i| i + 1);
    let trimmed = &path[start..end];
    let bad_segment = trimmed
        .split(|&b| b == b'/')
        .any(|s| s.is_empty() || s == b"." || s == b"..");
    if bad_segment {
        return Err(GitError::InvalidEntry {
            name: path.as_bstr().to_string(),
            reason: "path must be non-empty with no empty, `.` or `..` segments".to_owned(),
        });
    }
    if trimmed.contains(&0) {
        return Err(GitError::InvalidEntry {
            name: path.as_bstr().to_string(),
            reason: "path contains a NUL byte".to_owned(),
        });
    }
    Ok(trimmed)
}

/// `("a/b", "c")` for `"a/b/c"`, `("", "c")` for `"c"`.
fn split_path(path: &[u8]) -> (&[u8], &[u8]) {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => (&path[..0], path),
    }
}

/// Proper ancestor directories of `path`, nearest first, excluding the
/// root.
fn ancestors(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'/')
        .map(move |(i, _)| &path[..i])
        .rev()
}

/// `dir`'s proper ancestors including the root.
fn ancestors_of_dir(dir: &[u8]) -> impl Iterator<Item = &[u8]> {
    let root = (!dir.is_empty()).then_some(&b""[..]);
    ancestors(dir).chain(root)
}

fn depth(dir: &[u8]) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.iter().filter(|&&b| b == b'/').count() + 1
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
