//! Process plumbing for the git CLI.
//!
//! Every store operation is one `git` invocation. Besides the caller's
//! thread, each invocation runs:
//!
//! - a stderr reader (keeps the pipe drained, keeps the tail for errors),
//! - a watcher that kills the process once the [`CancellationToken`] fires,
//! - for streaming commands with input, a stdin feeder, so a large response
//!   can never block the writer (or vice versa).
//!
//! All helper threads are joined before a [`Running`] is released.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::cli_store::GitCli;
use crate::error::GitError;

/// How often the watcher looks at the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Only the tail of stderr is kept for error messages.
const STDERR_LIMIT: usize = 64 * 1024;

/// What to connect to the child's stdin.
pub(crate) enum Input {
    /// `/dev/null`.
    Null,
    /// A pipe handed back to the caller.
    Piped,
    /// A pipe fed from these bytes on a separate thread.
    Bytes(Vec<u8>),
}

// ---------------------------------------------------------------------------
// GitCommand
// ---------------------------------------------------------------------------

/// A single git invocation under construction.
pub(crate) struct GitCommand<'a> {
    git: &'a GitCli,
    config: Vec<String>,
    subcommand: &'static str,
    args: Vec<OsString>,
}

impl<'a> GitCommand<'a> {
    pub(crate) const fn new(git: &'a GitCli, subcommand: &'static str) -> Self {
        Self {
            git,
            config: Vec::new(),
            subcommand,
            args: Vec::new(),
        }
    }

    /// Add `-c <key>=<value>` before the subcommand.
    pub(crate) fn config(mut self, key: &str, value: &str) -> Self {
        self.config.push(format!("{key}={value}"));
        self
    }

    pub(crate) fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `"git <subcommand>"`, used in logs and errors.
    pub(crate) fn label(&self) -> String {
        format!("git {}", self.subcommand)
    }

    /// Start the process.
    ///
    /// Returns the running handle, the stdin pipe when `input` is
    /// [`Input::Piped`], and the stdout pipe.
    pub(crate) fn spawn(
        self,
        input: Input,
    ) -> Result<(Running, Option<ChildStdin>, ChildStdout), GitError> {
        let label = self.label();
        let cancel = self.git.cancellation().clone();
        if cancel.is_cancelled() {
            return Err(GitError::Cancelled { command: label });
        }

        let mut cmd = Command::new(self.git.executable());
        cmd.current_dir(self.git.dir())
            .envs(self.git.env().iter().map(|(k, v)| (k, v)))
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_PAGER", "cat")
            .env("LC_ALL", "C");
        for kv in &self.config {
            cmd.arg("-c").arg(kv);
        }
        cmd.arg(self.subcommand)
            .args(&self.args)
            .stdin(match input {
                Input::Null => Stdio::null(),
                Input::Piped | Input::Bytes(_) => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(command = %label, args = ?self.args, "spawning git");
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let child = Arc::new(Mutex::new(child));

        let mut running = Running {
            label,
            child: Arc::clone(&child),
            cancel: cancel.clone(),
            stderr: stderr.map(|pipe| thread::spawn(move || read_stderr(pipe))),
            feeder: None,
            watcher: Some(Watcher::start(child, cancel)),
            done: false,
        };

        let stdout = match stdout {
            Some(stdout) => stdout,
            None => {
                return Err(running.fail(GitError::Io(io::Error::other("stdout not captured"))));
            }
        };

        let stdin = match input {
            Input::Null => None,
            Input::Piped => stdin,
            Input::Bytes(bytes) => {
                if let Some(mut pipe) = stdin {
                    running.feeder = Some(thread::spawn(move || {
                        pipe.write_all(&bytes)
                        // pipe dropped here: EOF for the child
                    }));
                }
                None
            }
        };

        Ok((running, stdin, stdout))
    }

    /// Run to completion and return stdout.
    pub(crate) fn output(self) -> Result<Vec<u8>, GitError> {
        let (running, _, mut stdout) = self.spawn(Input::Null)?;
        let mut out = Vec::new();
        if let Err(e) = stdout.read_to_end(&mut out) {
            return Err(running.fail(e.into()));
        }
        drop(stdout);
        running.finish()?;
        Ok(out)
    }

    /// Run to completion, letting `write_input` produce stdin on this thread
    /// while stdout is collected on another.
    ///
    /// If `write_input` fails with anything other than a pipe error, the
    /// process is killed before it sees EOF, so it never acts on partial
    /// input.
    pub(crate) fn output_with_input<F>(self, write_input: F) -> Result<Vec<u8>, GitError>
    where
        F: FnOnce(&mut ChildStdin) -> Result<(), GitError>,
    {
        let (running, stdin, mut stdout) = self.spawn(Input::Piped)?;
        let collector = thread::spawn(move || {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).map(|_| out)
        });

        let Some(mut stdin) = stdin else {
            let err = running.fail(GitError::Io(io::Error::other("stdin not captured")));
            let _ = collector.join();
            return Err(err);
        };

        match write_input(&mut stdin) {
            Ok(()) => drop(stdin),
            Err(GitError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The child exited early; its status says why.
                drop(stdin);
                let _ = collector.join();
                running.finish()?;
                return Err(GitError::Io(e));
            }
            Err(e) => {
                // Kill before closing stdin so the child never sees EOF.
                let err = running.fail(e);
                drop(stdin);
                let _ = collector.join();
                return Err(err);
            }
        }

        let collected = collector
            .join()
            .map_err(|_| GitError::Io(io::Error::other("stdout reader panicked")));
        running.finish()?;
        Ok(collected??)
    }
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

/// A started git process and its helper threads.
///
/// Must be ended with [`Running::finish`] or [`Running::kill`]. Dropping it
/// kills the process as a last resort.
pub(crate) struct Running {
    label: String,
    child: Arc<Mutex<Child>>,
    cancel: CancellationToken,
    stderr: Option<JoinHandle<Vec<u8>>>,
    feeder: Option<JoinHandle<io::Result<()>>>,
    watcher: Option<Watcher>,
    done: bool,
}

impl Running {
    /// Wait for a normal exit.
    ///
    /// The owner of stdout must have read it to EOF (or dropped it) first.
    pub(crate) fn finish(mut self) -> Result<(), GitError> {
        self.done = true;

        let fed = self.feeder.take().map(join_io);
        let stderr = self.stderr.take().map(|h| h.join().unwrap_or_default());
        let status = lock(&self.child).wait();
        self.stop_watcher();

        if self.cancel.is_cancelled() {
            return Err(GitError::Cancelled {
                command: self.label.clone(),
            });
        }

        let status = status?;
        let stderr = String::from_utf8_lossy(stderr.as_deref().unwrap_or_default())
            .trim()
            .to_owned();
        if !stderr.is_empty() {
            tracing::debug!(command = %self.label, %stderr, "git stderr");
        }
        if !status.success() {
            return Err(GitError::CommandFailed {
                command: self.label.clone(),
                exit_code: status.code(),
                stderr,
            });
        }
        if let Some(Err(e)) = fed {
            return Err(GitError::Io(e));
        }
        Ok(())
    }

    /// Kill the process and reap it.
    ///
    /// Returns [`GitError::Cancelled`] if the token fired, since that is
    /// what the caller should report instead of whatever it observed.
    pub(crate) fn kill(mut self) -> Option<GitError> {
        self.done = true;
        self.terminate();
        self.cancel.is_cancelled().then(|| GitError::Cancelled {
            command: self.label.clone(),
        })
    }

    /// Kill the process, reporting `err` unless cancellation explains it.
    pub(crate) fn fail(self, err: GitError) -> GitError {
        self.kill().unwrap_or(err)
    }

    fn terminate(&mut self) {
        {
            let mut child = lock(&self.child);
            if matches!(child.try_wait(), Ok(None)) {
                tracing::debug!(command = %self.label, "killing git");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        self.stop_watcher();
        if let Some(h) = self.feeder.take() {
            let _ = h.join();
        }
        if let Some(h) = self.stderr.take() {
            let _ = h.join();
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(w) = self.watcher.take() {
            w.stop();
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(command = %self.label, "git process dropped without being reaped");
            self.terminate();
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Kills the child when the cancellation token fires.
struct Watcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Watcher {
    fn start(child: Arc<Mutex<Child>>, cancel: CancellationToken) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(CANCEL_POLL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        if cancel.is_cancelled() {
                            tracing::warn!("cancelled, killing git");
                            let _ = lock(&child).kill();
                            return;
                        }
                    }
                }
            }
        });
        Self { stop, handle }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_io(handle: JoinHandle<io::Result<()>>) -> io::Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
}

/// Drain stderr to EOF, keeping at most the last [`STDERR_LIMIT`] bytes.
fn read_stderr(mut pipe: impl Read) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > STDERR_LIMIT {
                    let excess = kept.len() - STDERR_LIMIT;
                    kept.drain(..excess);
                }
            }
        }
    }
    kept
}
