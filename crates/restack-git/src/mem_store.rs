//! An in-memory [`ObjectStore`] for tests.
//!
//! Objects are content-addressed with SHA-256, so identical content always
//! gets the same hash and trees can be compared by hash just like in a real
//! repository. Blob ids match those of a SHA-256 git repository. Tree ids use
//! a text encoding of the entries and do not.
//!
//! Merges are not computed: responses are scripted with
//! [`MemStore::script_merge_tree`] and served in order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bstr::{BStr, BString};
use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::error::GitError;
use crate::store::{BufferedResponse, ObjectStore, TokenStream, TreeEntries};
use crate::types::{Hash, ListTreeOptions, MergeTreeRequest, ObjectKind, TreeEntry};

#[derive(Clone, Debug)]
enum Object {
    Blob(Vec<u8>),
    Tree(Vec<TreeEntry>),
}

/// A thread-safe object store that lives in memory.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: Mutex<HashMap<Hash, Object>>,
    merge_responses: Mutex<VecDeque<Vec<u8>>>,
    merge_requests: Mutex<Vec<MergeTreeRequest>>,
    calls: Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl MemStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent call with [`GitError::Cancelled`] once `token`
    /// fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Queue a raw `merge-tree -z` response for the next
    /// [`merge_tree`](ObjectStore::merge_tree) call.
    pub fn script_merge_tree(&self, response: impl Into<Vec<u8>>) {
        lock(&self.merge_responses).push_back(response.into());
    }

    /// Every merge request received so far.
    #[must_use]
    pub fn merge_requests(&self) -> Vec<MergeTreeRequest> {
        lock(&self.merge_requests).clone()
    }

    /// A log of store calls, e.g. `"list_tree <hash>"` or
    /// `"hash_at <treeish>:<path>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    fn enter(&self, call: String) -> Result<(), GitError> {
        if self.cancel.is_cancelled() {
            let command = call.split(' ').next().unwrap_or_default().to_owned();
            return Err(GitError::Cancelled { command });
        }
        lock(&self.calls).push(call);
        Ok(())
    }

    fn get(&self, hash: Hash) -> Option<Object> {
        lock(&self.objects).get(&hash).cloned()
    }

    fn tree(&self, hash: Hash) -> Result<Vec<TreeEntry>, GitError> {
        match self.get(hash) {
            Some(Object::Tree(entries)) => Ok(entries),
            _ => Err(GitError::NotFound {
                message: format!("tree {hash}"),
            }),
        }
    }

    fn insert(&self, encoded: &[u8], object: Object) -> Hash {
        let hash = content_hash(encoded);
        lock(&self.objects).entry(hash).or_insert(object);
        hash
    }

    fn walk(&self, tree: Hash, prefix: &[u8], out: &mut Vec<Result<TreeEntry, GitError>>) {
        let entries = match self.tree(tree) {
            Ok(entries) => entries,
            Err(e) => {
                out.push(Err(e));
                return;
            }
        };
        for entry in entries {
            let mut path = BString::from(prefix);
            path.extend_from_slice(&entry.name);
            if entry.kind == ObjectKind::Tree {
                path.push(b'/');
                self.walk(entry.hash, &path, out);
            } else {
                out.push(Ok(TreeEntry { name: path, ..entry }));
            }
        }
    }
}

impl ObjectStore for MemStore {
    fn write_blob(&self, data: &mut dyn Read) -> Result<Hash, GitError> {
        self.enter("write_blob".to_owned())?;
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        let mut encoded = format!("blob {}\0", bytes.len()).into_bytes();
        encoded.extend_from_slice(&bytes);
        Ok(self.insert(&encoded, Object::Blob(bytes)))
    }

    fn read_blob(&self, hash: Hash, sink: &mut dyn Write) -> Result<(), GitError> {
        self.enter(format!("read_blob {hash}"))?;
        match self.get(hash) {
            Some(Object::Blob(bytes)) => Ok(sink.write_all(&bytes)?),
            _ => Err(GitError::NotFound {
                message: format!("blob {hash}"),
            }),
        }
    }

    fn list_tree(&self, tree: Hash, opts: ListTreeOptions) -> Result<TreeEntries<'_>, GitError> {
        self.enter(format!("list_tree {tree}"))?;
        if opts.recurse {
            let mut out = Vec::new();
            self.walk(tree, b"", &mut out);
            return Ok(TreeEntries::from_results(out));
        }
        Ok(TreeEntries::from_results(match self.tree(tree) {
            Ok(entries) => entries.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        }))
    }

    fn make_tree(
        &self,
        entries: &mut dyn Iterator<Item = Result<TreeEntry, GitError>>,
    ) -> Result<(Hash, usize), GitError> {
        self.enter("make_tree".to_owned())?;
        let mut seen = HashSet::new();
        let mut sorted = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            entry.validate()?;
            if !seen.insert(entry.name.clone()) {
                return Err(GitError::InvalidEntry {
                    name: entry.name.to_string(),
                    reason: "duplicate entry".to_owned(),
                });
            }
            sorted.insert(tree_order_key(&entry), entry);
        }
        let entries: Vec<TreeEntry> = sorted.into_values().collect();
        let count = entries.len();

        let mut body = Vec::new();
        for e in &entries {
            body.extend_from_slice(format!("{:o} {} {}\t", e.mode.octal(), e.kind, e.hash).as_bytes());
            body.extend_from_slice(&e.name);
            body.push(0);
        }
        let mut encoded = format!("tree {}\0", body.len()).into_bytes();
        encoded.extend_from_slice(&body);
        Ok((self.insert(&encoded, Object::Tree(entries)), count))
    }

    fn hash_at(&self, treeish: &str, path: &BStr) -> Result<Hash, GitError> {
        self.enter(format!("hash_at {treeish}:{path}"))?;
        let not_found = || GitError::NotFound {
            message: format!("`{treeish}:{path}` does not resolve"),
        };
        let mut current: Hash = treeish.parse().map_err(|_| not_found())?;
        self.tree(current).map_err(|_| not_found())?;
        for segment in path.split(|&b| b == b'/').filter(|s| !s.is_empty()) {
            let entries = self.tree(current).map_err(|_| not_found())?;
            current = entries
                .into_iter()
                .find(|e| e.name == segment)
                .map(|e| e.hash)
                .ok_or_else(not_found)?;
        }
        Ok(current)
    }

    fn peel_to_tree(&self, rev: &str) -> Result<Hash, GitError> {
        self.enter(format!("peel_to_tree {rev}"))?;
        let hash: Hash = rev.parse().map_err(|_| GitError::NotFound {
            message: format!("`{rev}` does not resolve"),
        })?;
        self.tree(hash).map(|_| hash)
    }

    fn merge_tree(&self, request: &MergeTreeRequest) -> Result<TokenStream<'_>, GitError> {
        self.enter(format!("merge_tree {} {}", request.branch1, request.branch2))?;
        lock(&self.merge_requests).push(request.clone());
        let response = lock(&self.merge_responses).pop_front().ok_or_else(|| {
            GitError::CommandFailed {
                command: "git merge-tree".to_owned(),
                exit_code: Some(128),
                stderr: "no scripted merge-tree response".to_owned(),
            }
        })?;
        Ok(TokenStream::new(
            "git merge-tree",
            BufferedResponse::new(response),
        ))
    }
}

/// Git sorts tree entries by name, comparing directories as if their name
/// ended in `/`.
fn tree_order_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.to_vec();
    if entry.kind == ObjectKind::Tree {
        key.push(b'/');
    }
    key
}

fn content_hash(encoded: &[u8]) -> Hash {
    Hash::from_digest(&Sha256::digest(encoded))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
