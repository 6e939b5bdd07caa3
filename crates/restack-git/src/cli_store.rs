//! [`ObjectStore`] backed by the `git` command-line client.

use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ChildStdout;

use bstr::{BStr, BString, ByteSlice};
use tracing::instrument;

use crate::cancel::CancellationToken;
use crate::cmd::{GitCommand, Input, Running};
use crate::error::GitError;
use crate::store::{EntrySource, ObjectStore, ResponseSource, TokenStream, TreeEntries};
use crate::types::{Hash, ListTreeOptions, MergeTreeRequest, TreeEntry};

/// A handle on one repository, driving the `git` executable.
///
/// Cloning is cheap. Each clone may carry its own cancellation token via
/// [`with_cancellation`](Self::with_cancellation); nothing is shared between
/// handles except the repository on disk.
#[derive(Clone, Debug)]
pub struct GitCli {
    executable: PathBuf,
    dir: PathBuf,
    env: Vec<(OsString, OsString)>,
    cancel: CancellationToken,
}

impl GitCli {
    /// Drive `git` from `PATH` inside `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: PathBuf::from("git"),
            dir: dir.into(),
            env: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a specific git binary.
    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Set an extra environment variable for every invocation.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// A copy of this handle observing `token`.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    /// The repository directory commands run in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The git binary.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// The token this handle observes.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    fn rev_parse(&self, rev: &OsStr) -> Result<Hash, GitError> {
        let out = GitCommand::new(self, "rev-parse")
            .args(["--verify", "--quiet", "--end-of-options"])
            .arg(rev)
            .output();
        match out {
            Ok(bytes) => parse_hash_line("git rev-parse", &bytes),
            Err(GitError::CommandFailed { .. }) => Err(GitError::NotFound {
                message: format!("`{}` does not resolve", rev.to_string_lossy()),
            }),
            Err(e) => Err(e),
        }
    }
}

impl ObjectStore for GitCli {
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    fn write_blob(&self, data: &mut dyn io::Read) -> Result<Hash, GitError> {
        let out = GitCommand::new(self, "hash-object")
            .args(["-w", "--stdin"])
            .output_with_input(|stdin| {
                io::copy(data, stdin)?;
                Ok(())
            })?;
        parse_hash_line("git hash-object", &out)
    }

    #[instrument(skip_all, fields(hash = %hash))]
    fn read_blob(&self, hash: Hash, sink: &mut dyn Write) -> Result<(), GitError> {
        let (running, _, stdout) = GitCommand::new(self, "cat-file")
            .args(["blob", hash.as_str()])
            .spawn(Input::Null)?;
        let mut stdout = stdout;
        if let Err(e) = io::copy(&mut stdout, sink) {
            return Err(running.fail(e.into()));
        }
        drop(stdout);
        running
            .finish()
            .map_err(|e| missing_object(e, &format!("blob {hash}")))
    }

    #[instrument(skip_all, fields(tree = %tree, recurse = opts.recurse))]
    fn list_tree(&self, tree: Hash, opts: ListTreeOptions) -> Result<TreeEntries<'_>, GitError> {
        let mut cmd = GitCommand::new(self, "ls-tree").arg("-z");
        if opts.recurse {
            cmd = cmd.arg("-r");
        }
        let (running, _, stdout) = cmd.arg("--end-of-options").arg(tree.as_str()).spawn(Input::Null)?;
        Ok(TreeEntries::new(LsTree {
            tree,
            stdout: BufReader::new(stdout),
            running: Some(running),
        }))
    }

    #[instrument(skip_all)]
    fn make_tree(
        &self,
        entries: &mut dyn Iterator<Item = Result<TreeEntry, GitError>>,
    ) -> Result<(Hash, usize), GitError> {
        let mut count = 0;
        let out = GitCommand::new(self, "mktree")
            .arg("-z")
            .output_with_input(|stdin| {
                let mut stdin = io::BufWriter::new(stdin);
                for entry in entries {
                    let entry = entry?;
                    entry.validate()?;
                    entry.write_record(&mut stdin)?;
                    stdin.write_all(b"\0")?;
                    count += 1;
                }
                stdin.flush()?;
                Ok(())
            })?;
        let hash = parse_hash_line("git mktree", &out)?;
        tracing::debug!(%hash, entries = count, "wrote tree");
        Ok((hash, count))
    }

    #[instrument(skip(self))]
    fn hash_at(&self, treeish: &str, path: &BStr) -> Result<Hash, GitError> {
        let mut object = BString::from(format!("{treeish}:"));
        object.extend_from_slice(path);
        // Only fails off Unix, where arguments must be Unicode.
        let arg = object.to_os_str().map_err(|_| GitError::InvalidEntry {
            name: path.to_string(),
            reason: "path is not valid UTF-8 on this platform".to_owned(),
        })?;
        self.rev_parse(arg)
    }

    #[instrument(skip(self))]
    fn peel_to_tree(&self, rev: &str) -> Result<Hash, GitError> {
        self.rev_parse(OsStr::new(&format!("{rev}^{{tree}}")))
    }

    #[instrument(skip_all, fields(branch1 = %request.branch1, branch2 = %request.branch2))]
    fn merge_tree(&self, request: &MergeTreeRequest) -> Result<TokenStream<'_>, GitError> {
        let line = merge_input_line(request)?;
        let mut cmd = GitCommand::new(self, "merge-tree");
        if let Some(style) = request.conflict_style {
            cmd = cmd.config("merge.conflictStyle", style.as_str());
        }
        let cmd = cmd.args(["--write-tree", "--stdin", "-z"]);
        let label = cmd.label();
        let (running, _, stdout) = cmd.spawn(Input::Bytes(line.into_bytes()))?;
        Ok(TokenStream::new(
            label,
            CliResponse {
                stdout: BufReader::new(stdout),
                running: Some(running),
            },
        ))
    }
}

/// One `--stdin` request line: `[<base> -- ]<branch1> <branch2>\n`.
fn merge_input_line(request: &MergeTreeRequest) -> Result<String, GitError> {
    let mut revs = vec![("branch1", &request.branch1), ("branch2", &request.branch2)];
    if let Some(base) = &request.merge_base {
        revs.push(("merge_base", base));
    }
    for (field, rev) in revs {
        if rev.is_empty() || rev.chars().any(char::is_whitespace) {
            return Err(GitError::InvalidEntry {
                name: rev.clone(),
                reason: format!("{field} must be a non-empty revision without whitespace"),
            });
        }
    }
    Ok(match &request.merge_base {
        Some(base) => format!("{base} -- {} {}\n", request.branch1, request.branch2),
        None => format!("{} {}\n", request.branch1, request.branch2),
    })
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

fn parse_hash_line(command: &str, out: &[u8]) -> Result<Hash, GitError> {
    let text = std::str::from_utf8(out)
        .map_err(|_| GitError::protocol(command, "hash is not UTF-8"))?
        .trim();
    text.parse()
        .map_err(|e| GitError::protocol(command, format!("expected a hash: {e}")))
}

/// Parse one `ls-tree -z` record: `<mode> SP <type> SP <hash> TAB <name>`.
pub(crate) fn parse_ls_tree_record(record: &[u8]) -> Result<TreeEntry, GitError> {
    TreeEntry::parse_record(record).map_err(|e| GitError::protocol("git ls-tree", e))
}

/// Turn a failed lookup into [`GitError::NotFound`] when stderr says the
/// object is missing or of the wrong type.
fn missing_object(err: GitError, what: &str) -> GitError {
    const MARKERS: [&str; 4] = [
        "Not a valid object name",
        "not a tree object",
        "bad file",
        "unable to read",
    ];
    match err {
        GitError::CommandFailed { ref stderr, .. } if MARKERS.iter().any(|m| stderr.contains(m)) => {
            GitError::NotFound {
                message: format!("{what}: {stderr}"),
            }
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Streaming sources
// ---------------------------------------------------------------------------

struct LsTree {
    tree: Hash,
    stdout: BufReader<ChildStdout>,
    running: Option<Running>,
}

impl EntrySource for LsTree {
    fn next_entry(&mut self) -> Option<Result<TreeEntry, GitError>> {
        let mut record = Vec::new();
        let read = self.stdout.read_until(0, &mut record);
        let running = self.running.take()?;
        match read {
            Err(e) => Some(Err(running.fail(e.into()))),
            Ok(0) => match running.finish() {
                Ok(()) => None,
                Err(e) => Some(Err(missing_object(e, &format!("tree {}", self.tree)))),
            },
            Ok(_) => {
                if record.last() == Some(&0) {
                    record.pop();
                }
                match parse_ls_tree_record(&record) {
                    Ok(entry) => {
                        self.running = Some(running);
                        Some(Ok(entry))
                    }
                    Err(e) => Some(Err(running.fail(e))),
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), GitError> {
        self.running
            .take()
            .and_then(Running::kill)
            .map_or(Ok(()), Err)
    }
}

struct CliResponse {
    stdout: BufReader<ChildStdout>,
    running: Option<Running>,
}

impl ResponseSource for CliResponse {
    fn reader(&mut self) -> &mut dyn BufRead {
        &mut self.stdout
    }

    fn finish(&mut self) -> Result<(), GitError> {
        // Anything left unread would keep the child blocked on a full pipe.
        io::copy(&mut self.stdout, &mut io::sink())?;
        self.running.take().map_or(Ok(()), Running::finish)
    }

    fn abort(&mut self) -> Option<GitError> {
        self.running.take().and_then(Running::kill)
    }
}
