//! Content-addressed storage layer.
//!
//! Architecture, bottom up:
//!
//! - [`store`] — bare git object databases used as blob stores; a
//!   [`store::StorePool`] opens and caches them per store id
//! - [`types`] — validated identifiers: repo ids, object/commit/tree/file
//!   ids, file names and repository paths
//! - [`tree`] — immutable directory trees (name -> entry maps), path
//!   resolution, persistent rebuild on change, diff
//! - [`commit`] — immutable commits chaining root trees into history
//! - [`refs`] — the single mutable cell per repository: its branch head,
//!   moved only by compare-and-swap
//!
//! Mutation never edits in place. New trees and a new commit are written
//! first, then the head swings to the new commit if nobody moved it in the
//! meantime.

pub mod commit;
pub mod error;
pub mod refs;
pub mod store;
pub mod tree;
pub mod types;

pub use commit::{Commit, CommitBuilder, CommitMessage, History, REPO_FORMAT_VERSION};
pub use error::{StorageError, StorageResult};
pub use store::{ObjectStore, StorePool};
pub use tree::{ChangeKind, Dirent, Tree, TreeChange, DEFAULT_FILE_MODE};
pub use types::{
    Author, CommitId, FileId, FileName, InvalidNameError, ObjectId, RepoId, RepoPath, TreeId,
};
