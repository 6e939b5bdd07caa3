//! Server-side three-way tree merges.
//!
//! [`merge_tree`] runs one `git merge-tree --write-tree --stdin -z` exchange
//! through the [`ObjectStore`] and turns its NUL-delimited response into a
//! [`MergeOutcome`]. Conflicts are an outcome, not an error: only transport,
//! process and grammar failures are reported as [`GitError`].
//!
//! # Response grammar
//!
//! ```text
//! status   "1" (clean) | "0" (conflicted)
//! tree     <hash>                          always present
//! -- conflicted only --
//! files    { "<mode> <hash> <stage>\t<path>" } ""
//! messages { <N> <path>*N <type> <message> } ""
//! -- clean only --
//! ""
//! ```
//!
//! A missing final terminator is tolerated. Anything after the first result
//! is a protocol error: one request, one result.
//!
//! Paths and messages are kept as raw bytes. Status, hashes, counts and
//! annotation types must be UTF-8.

use std::fmt;

use bstr::{BStr, BString, ByteSlice};
use restack_git::{
    ConflictStage, GitError, Hash, MergeTreeRequest, Mode, ObjectStore, TokenStream,
    serialize_path, serialize_paths,
};
use serde::Serialize;
use tracing::instrument;

/// The stable annotation type git emits for a file it merged by itself.
pub const AUTO_MERGING: &str = "Auto-merging";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Result of a completed merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOutcome {
    /// Merged without conflicts into this tree.
    Clean(Hash),
    /// At least one file needs resolution.
    Conflicted(MergeConflict),
}

impl MergeOutcome {
    /// The resulting tree. For conflicts this is git's best effort, with
    /// conflict markers written into the conflicted blobs.
    #[must_use]
    pub const fn tree(&self) -> Hash {
        match self {
            Self::Clean(tree) => *tree,
            Self::Conflicted(conflict) => conflict.tree,
        }
    }

    /// Return `true` for [`MergeOutcome::Clean`].
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }

    /// The conflict, if any.
    #[must_use]
    pub const fn conflict(&self) -> Option<&MergeConflict> {
        match self {
            Self::Clean(_) => None,
            Self::Conflicted(conflict) => Some(conflict),
        }
    }
}

/// A merge that left files needing resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    /// Best-effort merged tree.
    pub tree: Hash,
    /// One entry per present stage of each conflicted path.
    pub files: Vec<MergeConflictFile>,
    /// Informational messages. These may mention paths that were resolved
    /// automatically and have no entry in `files`.
    pub annotations: Vec<MergeAnnotation>,
}

impl MergeConflict {
    /// Conflicted paths, each once, in first-seen order.
    pub fn filenames(&self) -> impl Iterator<Item = &BStr> {
        let mut seen = std::collections::HashSet::new();
        self.files
            .iter()
            .map(|f| f.path.as_bstr())
            .filter(move |path| seen.insert(*path))
    }

    /// Annotations describing blocking conflicts (everything except
    /// auto-merges).
    pub fn blocking_annotations(&self) -> impl Iterator<Item = &MergeAnnotation> {
        self.annotations.iter().filter(|a| !a.is_auto_merge())
    }
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("conflicting files:")?;
        for (i, name) in self.filenames().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeConflict {}

/// One stage of one conflicted path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeConflictFile {
    /// File mode of this stage.
    pub mode: Mode,
    /// Blob (or other object) of this stage.
    pub object: Hash,
    /// Which side this version comes from.
    pub stage: ConflictStage,
    /// Path from the tree root.
    #[serde(serialize_with = "serialize_path")]
    pub path: BString,
}

impl MergeConflictFile {
    /// Parse `<mode> <object> <stage>\t<path>`. The path is taken as-is.
    ///
    /// # Errors
    ///
    /// A description of the first malformed field.
    pub fn parse(record: &[u8]) -> Result<Self, String> {
        let tab = record
            .find_byte(b'\t')
            .ok_or("expected <stage> and <path>")?;
        let header = std::str::from_utf8(&record[..tab]).map_err(|_| "malformed header")?;
        let path = &record[tab + 1..];
        let (mode, rest) = header.split_once(' ').ok_or("expected <mode>")?;
        let (object, stage) = rest.split_once(' ').ok_or("expected <object>")?;
        if path.is_empty() {
            return Err("empty path".to_owned());
        }
        Ok(Self {
            mode: mode.parse().map_err(|e| format!("{e}"))?,
            object: object.parse().map_err(|e| format!("{e}"))?,
            stage: stage.parse()?,
            path: BString::from(path),
        })
    }
}

/// An informational message from the merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeAnnotation {
    /// Paths the message is about.
    #[serde(serialize_with = "serialize_paths")]
    pub paths: Vec<BString>,
    /// Stable machine tag, e.g. `"Auto-merging"` or `"CONFLICT (contents)"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable text. Not stable across git versions, and quotes
    /// paths verbatim.
    #[serde(serialize_with = "serialize_path")]
    pub message: BString,
}

impl MergeAnnotation {
    /// Return `true` if git merged these paths without help.
    #[must_use]
    pub fn is_auto_merge(&self) -> bool {
        self.kind == AUTO_MERGING
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Merge `request.branch2` into `request.branch1` without touching any
/// working tree or index.
///
/// An empty conflicted-files section means a clean merge, even when git
/// printed annotations such as auto-merges.
///
/// # Errors
///
/// - [`GitError::Protocol`] when the response breaks the grammar.
/// - [`GitError::CommandFailed`] when git refuses the request (unknown
///   revision, unsupported merge base).
/// - [`GitError::Cancelled`] when the store's token fires.
#[instrument(skip_all, fields(branch1 = %request.branch1, branch2 = %request.branch2, base = ?request.merge_base))]
pub fn merge_tree(
    store: &dyn ObjectStore,
    request: &MergeTreeRequest,
) -> Result<MergeOutcome, GitError> {
    let mut stream = store.merge_tree(request)?;
    match read_outcome(&mut stream) {
        Ok(outcome) => {
            stream.finish()?;
            match &outcome {
                MergeOutcome::Clean(tree) => tracing::debug!(%tree, "clean merge"),
                MergeOutcome::Conflicted(c) => tracing::debug!(
                    tree = %c.tree,
                    files = c.files.len(),
                    annotations = c.annotations.len(),
                    "conflicted merge"
                ),
            }
            Ok(outcome)
        }
        Err(err @ GitError::Protocol { .. }) => {
            // A refused request produces no output; the exit status explains
            // it better than the truncated grammar does.
            stream.finish()?;
            Err(err)
        }
        Err(err) => Err(stream.fail(err)),
    }
}

/// Parse a complete merge-tree response.
///
/// # Errors
///
/// [`GitError::Protocol`] for grammar violations, [`GitError::Io`] if
/// reading fails.
pub fn read_outcome(stream: &mut TokenStream<'_>) -> Result<MergeOutcome, GitError> {
    let mut parser = Parser { stream };
    let outcome = parser.result()?;
    if let Some(token) = parser.stream.next_token()? {
        return Err(parser.error(format!(
            "expected one result, found more output ({:?})",
            token.as_bstr()
        )));
    }
    Ok(outcome)
}

struct Parser<'s, 'a> {
    stream: &'s mut TokenStream<'a>,
}

impl Parser<'_, '_> {
    fn error(&self, message: impl Into<String>) -> GitError {
        GitError::Protocol {
            command: self.stream.command().to_owned(),
            message: message.into(),
        }
    }

    /// The next token. `None` at end of stream.
    fn token(&mut self) -> Result<Option<Vec<u8>>, GitError> {
        self.stream.next_token()
    }

    fn require(&mut self, what: &str) -> Result<Vec<u8>, GitError> {
        self.token()?
            .ok_or_else(|| self.error(format!("expected {what}, got end of output")))
    }

    /// A token of the grammar itself rather than a path or message.
    fn require_text(&mut self, what: &str) -> Result<String, GitError> {
        let bytes = self.require(what)?;
        String::from_utf8(bytes).map_err(|e| {
            self.error(format!("expected {what}, got {:?}", e.as_bytes().as_bstr()))
        })
    }

    fn result(&mut self) -> Result<MergeOutcome, GitError> {
        let clean = match self.require_text("merge status")?.as_str() {
            "1" => true,
            "0" => false,
            other => return Err(self.error(format!("expected '0' or '1', got {other:?}"))),
        };
        let tree_token = self.require_text("tree hash")?;
        let tree: Hash = tree_token
            .parse()
            .map_err(|e| self.error(format!("bad tree hash: {e}")))?;

        if clean {
            self.end_of_section("end of result")?;
            return Ok(MergeOutcome::Clean(tree));
        }

        let files = self.conflict_files()?;
        let annotations = self.annotations()?;
        if files.is_empty() {
            return Ok(MergeOutcome::Clean(tree));
        }
        Ok(MergeOutcome::Conflicted(MergeConflict {
            tree,
            files,
            annotations,
        }))
    }

    /// Consume a section terminator. End of output counts as one.
    fn end_of_section(&mut self, what: &str) -> Result<(), GitError> {
        match self.token()? {
            None => Ok(()),
            Some(t) if t.is_empty() => Ok(()),
            Some(t) => Err(self.error(format!("expected {what}, got {:?}", t.as_bstr()))),
        }
    }

    fn conflict_files(&mut self) -> Result<Vec<MergeConflictFile>, GitError> {
        let mut files = Vec::new();
        loop {
            let token = self.require("conflicted file or end of section")?;
            if token.is_empty() {
                return Ok(files);
            }
            let file = MergeConflictFile::parse(&token).map_err(|e| {
                self.error(format!("bad conflicted file {:?}: {e}", token.as_bstr()))
            })?;
            files.push(file);
        }
    }

    fn annotations(&mut self) -> Result<Vec<MergeAnnotation>, GitError> {
        let mut annotations = Vec::new();
        loop {
            let count = match self.token()? {
                None => return Ok(annotations),
                Some(t) if t.is_empty() => return Ok(annotations),
                Some(t) => t,
            };
            let count: usize = count
                .to_str()
                .ok()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| {
                    self.error(format!("expected path count, got {:?}", count.as_bstr()))
                })?;
            let mut paths = Vec::with_capacity(count.min(64));
            for i in 0..count {
                paths.push(BString::from(self.require(&format!("path #{}", i + 1))?));
            }
            let kind = self.require_text("message type")?;
            let message = BString::from(self.require("message")?);
            annotations.push(MergeAnnotation {
                paths,
                kind,
                message,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
