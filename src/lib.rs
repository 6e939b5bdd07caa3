//! restack library crate.
//!
//! The plumbing core behind stacked-branch tooling: sparse tree edits
//! ([`tree_patch`]) and server-side merges ([`merge_tree`]) over a git object
//! store. The store itself, and the object model shared by both engines, live
//! in the `restack-git` crate. The `restack` binary is a thin scripting
//! surface over this API.

pub mod config;
pub mod merge_tree;
pub mod telemetry;
pub mod tree_patch;

pub use merge_tree::{MergeAnnotation, MergeConflict, MergeConflictFile, MergeOutcome};
pub use tree_patch::{UpdateTreeRequest, make_tree_recursive, update_tree};
