//! The [`ObjectStore`] trait: the single boundary between restack and git.
//!
//! Everything above this crate (tree patching, merge-tree parsing) talks to
//! the object database only through this trait. It is object-safe so callers
//! can hold `&dyn ObjectStore`.
//!
//! | Method          | Backing git command                                   |
//! |-----------------|-------------------------------------------------------|
//! | `write_blob`    | `git hash-object -w --stdin`                          |
//! | `read_blob`     | `git cat-file blob <hash>`                            |
//! | `list_tree`     | `git ls-tree -z [-r] <tree>`                          |
//! | `make_tree`     | `git mktree -z`                                       |
//! | `hash_at`       | `git rev-parse --verify --quiet <treeish>:<path>`     |
//! | `peel_to_tree`  | `git rev-parse --verify --quiet <rev>^{tree}`         |
//! | `merge_tree`    | `git merge-tree --write-tree --stdin -z`              |

use std::io::{self, BufRead, Read, Write};

use bstr::BStr;

use crate::error::GitError;
use crate::types::{Hash, ListTreeOptions, MergeTreeRequest, TreeEntry};

/// Access to a content-addressed object database.
///
/// A store handle is cheap to clone and carries its own working directory
/// and cancellation token, so concurrent calls on separate handles never
/// interfere. Implementations never change anything beyond adding objects.
pub trait ObjectStore {
    // -----------------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------------

    /// Store the bytes of `data` as a blob and return its hash.
    fn write_blob(&self, data: &mut dyn Read) -> Result<Hash, GitError>;

    /// Copy the contents of blob `hash` into `sink`.
    ///
    /// Fails with [`GitError::NotFound`] if the blob does not exist.
    fn read_blob(&self, hash: Hash, sink: &mut dyn Write) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Trees
    // -----------------------------------------------------------------------

    /// List the entries of tree `tree`.
    ///
    /// The listing is lazy and in store order. A missing tree is reported
    /// through the sequence, not up front. With `opts.recurse`, only non-tree
    /// entries are yielded and their names are slash-joined full paths.
    fn list_tree(&self, tree: Hash, opts: ListTreeOptions) -> Result<TreeEntries<'_>, GitError>;

    /// Build a tree object from `entries` and return its hash and the number
    /// of entries written.
    ///
    /// Entries may arrive in any order. The first `Err` item, or the first
    /// entry that fails [`TreeEntry::validate`], aborts the write; no tree is
    /// created.
    fn make_tree(
        &self,
        entries: &mut dyn Iterator<Item = Result<TreeEntry, GitError>>,
    ) -> Result<(Hash, usize), GitError>;

    /// Hash of the object at `path` inside `treeish`. An empty path names
    /// the tree itself.
    ///
    /// Any lookup failure other than cancellation is reported as
    /// [`GitError::NotFound`].
    fn hash_at(&self, treeish: &str, path: &BStr) -> Result<Hash, GitError>;

    /// Resolve a revision (commit, tag or tree) to its tree hash.
    fn peel_to_tree(&self, rev: &str) -> Result<Hash, GitError>;

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Start a server-side three-way merge and return its raw
    /// NUL-delimited response.
    ///
    /// Parsing the response is left to the caller.
    fn merge_tree(&self, request: &MergeTreeRequest) -> Result<TokenStream<'_>, GitError>;

    // -----------------------------------------------------------------------
    // Provided
    // -----------------------------------------------------------------------

    /// [`write_blob`](Self::write_blob) for an in-memory buffer.
    fn write_blob_bytes(&self, data: &[u8]) -> Result<Hash, GitError> {
        let mut reader = data;
        self.write_blob(&mut reader)
    }

    /// [`make_tree`](Self::make_tree) for an in-memory list of entries.
    fn make_tree_from(&self, entries: &[TreeEntry]) -> Result<(Hash, usize), GitError> {
        let mut iter = entries.iter().cloned().map(Ok);
        self.make_tree(&mut iter)
    }
}

// ---------------------------------------------------------------------------
// TreeEntries
// ---------------------------------------------------------------------------

/// Backend half of a [`TreeEntries`] listing.
pub trait EntrySource {
    /// The next entry, `None` once the listing is exhausted.
    fn next_entry(&mut self) -> Option<Result<TreeEntry, GitError>>;

    /// Stop early and release the underlying process. Must be idempotent.
    fn close(&mut self) -> Result<(), GitError>;
}

/// A lazy tree listing.
///
/// Iteration stops after the first error. Dropping the listing early
/// releases the underlying process; [`close`](Self::close) does the same
/// but reports failures.
pub struct TreeEntries<'a> {
    source: Box<dyn EntrySource + 'a>,
    done: bool,
}

impl<'a> TreeEntries<'a> {
    /// Wrap a backend source.
    pub fn new(source: impl EntrySource + 'a) -> Self {
        Self {
            source: Box::new(source),
            done: false,
        }
    }

    /// A listing over precomputed results.
    #[must_use]
    pub fn from_results(items: Vec<Result<TreeEntry, GitError>>) -> Self {
        Self::new(VecSource(items.into_iter()))
    }

    /// Stop early, reporting any failure releasing the source.
    pub fn close(mut self) -> Result<(), GitError> {
        self.done = true;
        self.source.close()
    }

    /// Read the whole listing, failing on the first error.
    pub fn collect_entries(self) -> Result<Vec<TreeEntry>, GitError> {
        self.collect()
    }
}

impl Iterator for TreeEntries<'_> {
    type Item = Result<TreeEntry, GitError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.source.next_entry();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

impl Drop for TreeEntries<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.source.close() {
            tracing::debug!(error = %e, "closing tree listing");
        }
    }
}

impl std::fmt::Debug for TreeEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeEntries").field("done", &self.done).finish_non_exhaustive()
    }
}

struct VecSource(std::vec::IntoIter<Result<TreeEntry, GitError>>);

impl EntrySource for VecSource {
    fn next_entry(&mut self) -> Option<Result<TreeEntry, GitError>> {
        self.0.next()
    }

    fn close(&mut self) -> Result<(), GitError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TokenStream
// ---------------------------------------------------------------------------

/// Backend half of a [`TokenStream`].
pub trait ResponseSource {
    /// The raw response bytes.
    fn reader(&mut self) -> &mut dyn BufRead;

    /// Confirm the producer exited cleanly. Called after the reader is
    /// exhausted.
    fn finish(&mut self) -> Result<(), GitError>;

    /// Stop the producer. Returns [`GitError::Cancelled`] if cancellation
    /// caused the stream to end, which takes precedence over whatever the
    /// consumer observed.
    fn abort(&mut self) -> Option<GitError>;
}

/// A NUL-delimited response from the store.
///
/// Consumers read tokens with [`next_token`](Self::next_token) and must end
/// with [`finish`](Self::finish) on success or [`fail`](Self::fail) on a
/// parse error. Dropping the stream aborts the producer.
pub struct TokenStream<'a> {
    command: String,
    source: Box<dyn ResponseSource + 'a>,
    ended: bool,
}

impl<'a> TokenStream<'a> {
    /// Wrap a backend source. `command` names the producer in errors.
    pub fn new(command: impl Into<String>, source: impl ResponseSource + 'a) -> Self {
        Self {
            command: command.into(),
            source: Box::new(source),
            ended: false,
        }
    }

    /// The producing command, e.g. `"git merge-tree"`.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Read the next NUL-terminated token, without the terminator.
    ///
    /// Returns `None` at end of stream. A trailing token with no terminator
    /// is returned as-is.
    pub fn next_token(&mut self) -> Result<Option<Vec<u8>>, GitError> {
        let mut buf = Vec::new();
        let n = read_token(self.source.reader(), &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// End a fully consumed stream and confirm the producer succeeded.
    pub fn finish(mut self) -> Result<(), GitError> {
        self.ended = true;
        self.source.finish()
    }

    /// End the stream because of `err`, returning the error to report.
    #[must_use]
    pub fn fail(mut self, err: GitError) -> GitError {
        self.ended = true;
        self.source.abort().unwrap_or(err)
    }
}

impl Drop for TokenStream<'_> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.source.abort();
        }
    }
}

impl std::fmt::Debug for TokenStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("command", &self.command)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

fn read_token(reader: &mut dyn BufRead, buf: &mut Vec<u8>) -> io::Result<usize> {
    loop {
        match reader.read_until(0, buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

/// A [`ResponseSource`] over bytes already in memory.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    cursor: io::Cursor<Vec<u8>>,
}

impl BufferedResponse {
    /// Serve `bytes` as the whole response.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self {
            cursor: io::Cursor::new(bytes),
        }
    }
}

impl ResponseSource for BufferedResponse {
    fn reader(&mut self) -> &mut dyn BufRead {
        &mut self.cursor
    }

    fn finish(&mut self) -> Result<(), GitError> {
        Ok(())
    }

    fn abort(&mut self) -> Option<GitError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;

    fn entry(name: &str) -> TreeEntry {
        TreeEntry::new_blob(name, Mode::Regular, Hash::ZERO)
    }

    #[test]
    fn entries_stop_after_error() {
        let listing = TreeEntries::from_results(vec![
            Ok(entry("a")),
            Err(GitError::NotFound {
                message: "gone".into(),
            }),
            Ok(entry("b")),
        ]);
        let items: Vec<_> = listing.collect();
        assert_eq!(items.len(), 2);
        assert!(items[1].as_ref().is_err_and(GitError::is_not_found));
    }

    #[test]
    fn collect_entries_fails_on_error() {
        let listing = TreeEntries::from_results(vec![Err(GitError::NotFound {
            message: "gone".into(),
        })]);
        assert!(listing.collect_entries().is_err_and(|e| e.is_not_found()));
    }

    #[test]
    fn tokens_split_on_nul() {
        let mut stream = TokenStream::new("test", BufferedResponse::new(b"a\0\0bc\0tail".to_vec()));
        assert_eq!(stream.next_token().unwrap(), Some(b"a".to_vec()));
        assert_eq!(stream.next_token().unwrap(), Some(Vec::new()));
        assert_eq!(stream.next_token().unwrap(), Some(b"bc".to_vec()));
        assert_eq!(stream.next_token().unwrap(), Some(b"tail".to_vec()));
        assert_eq!(stream.next_token().unwrap(), None);
        stream.finish().unwrap();
    }

    #[test]
    fn fail_returns_consumer_error_without_cancellation() {
        let stream = TokenStream::new("test", BufferedResponse::default());
        let err = stream.fail(GitError::protocol("test", "nope"));
        assert!(matches!(err, GitError::Protocol { .. }));
    }
}
