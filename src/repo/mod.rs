//! Repository engine layer.
//!
//! Sits on top of [`crate::storage`] and [`crate::metadata`] and exposes
//! repositories as callers see them: lifecycle ([`engine`]), the atomic
//! mutation pipeline ([`pipeline`]), the descriptor cache ([`registry`]),
//! virtual repositories ([`virtual_repo`]) and origin/virtual sync
//! ([`merge`]).

pub mod engine;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod registry;
pub mod virtual_repo;

pub use engine::{DeletedEntry, EntryInfo, FileRevision, RepoEngine};
pub use error::{RepoError, RepoResult};
pub use merge::MergeOutcome;
pub use pipeline::{FileOp, MAX_COMMIT_ATTEMPTS};
pub use registry::{RepoDescriptor, RepoRegistry};
