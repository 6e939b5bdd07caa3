//! Shared test helpers for restack integration tests.
//!
//! All tests use temp directories with their own git repo; nothing touches
//! the real repository.

#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};

use restack_git::GitCli;
use tempfile::TempDir;

/// Create a fresh git repo on branch `main` with an identity configured.
pub fn setup_repo() -> (TempDir, GitCli) {
    let dir = TempDir::new().expect("failed to create temp dir");
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test User"]);
    git(dir.path(), &["config", "commit.gpgsign", "false"]);
    let store = GitCli::new(dir.path());
    (dir, store)
}

/// Run git and assert it succeeds. Returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).unwrap().trim().to_owned()
}

/// Write `files` into the working tree, commit everything, return the commit id.
pub fn commit(dir: &Path, message: &str, files: &[(&str, &str)]) -> String {
    for (path, content) in files {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "--allow-empty", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Content of `path` in `tree`.
pub fn show(dir: &Path, tree: &str, path: &str) -> String {
    git(dir, &["cat-file", "blob", &format!("{tree}:{path}")])
}

// ---------------------------------------------------------------------------
// Version gating
// ---------------------------------------------------------------------------

/// The installed git's `(major, minor)`.
pub fn git_version() -> (u32, u32) {
    let out = Command::new("git")
        .arg("--version")
        .output()
        .expect("failed to run git --version");
    // "git version 2.45.1" or "git version 2.39.3 (Apple Git-146)"
    let text = String::from_utf8_lossy(&out.stdout);
    let version = text.split_whitespace().nth(2).unwrap_or("0.0");
    let mut parts = version.split('.').map(|p| p.parse().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// Whether git is at least `major.minor`. Prints a skip note when not.
pub fn git_at_least(major: u32, minor: u32, test: &str) -> bool {
    let ok = git_version() >= (major, minor);
    if !ok {
        eprintln!("skipping {test}: needs git >= {major}.{minor}");
    }
    ok
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

/// Run the restack binary in `dir`.
pub fn restack_in(dir: &Path, args: &[&str], stdin: Option<&[u8]>) -> Output {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Command::new(env!("CARGO_BIN_EXE_restack"))
        .args(args)
        .current_dir(dir)
        .env_remove("RESTACK_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to execute restack");
    let mut pipe = child.stdin.take().unwrap();
    if let Some(input) = stdin {
        pipe.write_all(input).unwrap();
    }
    drop(pipe);
    child.wait_with_output().unwrap()
}

/// Run restack and assert it succeeds. Returns trimmed stdout.
pub fn restack_ok(dir: &Path, args: &[&str]) -> String {
    let out = restack_in(dir, args, None);
    assert!(
        out.status.success(),
        "restack {} failed:\nstdout: {}\nstderr: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8(out.stdout).unwrap().trim().to_owned()
}
