//! Object model and object-store client for restack.
//!
//! This crate defines the [`ObjectStore`] trait, the single interface
//! through which restack reads and writes git objects. The production
//! backend, [`GitCli`], drives the `git` executable; [`MemStore`] is an
//! in-memory double for tests.
//!
//! # Crate layout
//!
//! - [`store`]: the [`ObjectStore`] trait and its streaming handles
//!   ([`TreeEntries`], [`TokenStream`]).
//! - [`types`]: value types used in trait signatures ([`Hash`], [`Mode`],
//!   [`TreeEntry`], [`MergeTreeRequest`], etc.).
//! - [`error`]: the [`GitError`] enum returned by all trait methods.
//! - [`cancel`]: [`CancellationToken`], observed by every store call.
//!
//! Tree entry names and paths are [`BString`]s: git stores them as raw
//! bytes.

pub mod cancel;
pub mod error;
pub mod store;
pub mod types;

mod cli_store;
mod cmd;
mod mem_store;

pub use cancel::CancellationToken;
pub use cli_store::GitCli;
pub use error::GitError;
pub use mem_store::MemStore;
pub use store::{
    BufferedResponse, EntrySource, ObjectStore, ResponseSource, TokenStream, TreeEntries,
};
pub use bstr::{BStr, BString};
pub use types::{
    BlobInfo, ConflictStage, ConflictStyle, Hash, HashParseError, ListTreeOptions,
    MergeTreeRequest, Mode, ModeParseError, ObjectKind, TreeEntry, serialize_path,
    serialize_paths,
};
