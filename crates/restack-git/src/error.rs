//! Error types for object-store operations.
//!
//! [`GitError`] is the single error type returned by every
//! [`ObjectStore`](crate::ObjectStore) method and by the engines built on it.
//! It uses rich enum variants so callers can match on specific failure modes
//! (missing object, protocol mismatch, cancellation) without parsing error
//! messages.

use thiserror::Error;

use crate::types::HashParseError;

/// Errors returned by [`ObjectStore`](crate::ObjectStore) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A requested object or path was not found.
    ///
    /// Often recoverable: an absent subtree is treated as empty.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// A tree entry was rejected before it reached the store.
    #[error("invalid entry `{name}`: {reason}")]
    InvalidEntry {
        /// The offending name or path.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A hash supplied by the caller could not be parsed.
    #[error(transparent)]
    InvalidHash(#[from] HashParseError),

    /// An I/O error talking to the store process (spawn, pipes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store process exited unsuccessfully.
    #[error("`{command}` failed{}: {stderr}", exit_suffix(.exit_code))]
    CommandFailed {
        /// The command that was run (e.g. `"git mktree"`).
        command: String,
        /// Process exit code, if it exited normally.
        exit_code: Option<i32>,
        /// Trimmed stderr output.
        stderr: String,
    },

    /// The store answered successfully but the answer did not follow the
    /// expected grammar. Usually a store version mismatch.
    #[error("bad `{command}` output: {message}")]
    Protocol {
        /// The command whose output was malformed.
        command: String,
        /// What was wrong.
        message: String,
    },

    /// An engine bookkeeping invariant was violated. Always a bug.
    #[error("internal invariant violated: {message}")]
    InvariantViolation {
        /// Description of the broken invariant.
        message: String,
    },

    /// The operation was cancelled and the store process terminated.
    #[error("`{command}` cancelled")]
    Cancelled {
        /// The command that was running (or about to run).
        command: String,
    },
}

#[allow(clippy::ref_option)]
fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit {c})")).unwrap_or_default()
}

impl GitError {
    /// Return `true` for [`GitError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Return `true` for [`GitError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn protocol(command: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = GitError::CommandFailed {
            command: "git mktree".to_owned(),
            exit_code: Some(128),
            stderr: "fatal: bad input".to_owned(),
        };
        assert_eq!(err.to_string(), "`git mktree` failed (exit 128): fatal: bad input");

        let killed = GitError::CommandFailed {
            command: "git ls-tree".to_owned(),
            exit_code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "`git ls-tree` failed: ");
    }

    #[test]
    fn predicates() {
        assert!(GitError::NotFound { message: "x".into() }.is_not_found());
        assert!(GitError::Cancelled { command: "git".into() }.is_cancelled());
        assert!(!GitError::protocol("git", "bad").is_not_found());
    }
}
