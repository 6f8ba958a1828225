//! Storage layer error types.
//!
//! Everything that can go wrong while talking to an object store: missing
//! objects, malformed serialized trees/commits, ref problems. The engine
//! layer wraps these with repository/path context before they reach callers.

use thiserror::Error;

use crate::storage::types::{CommitId, InvalidNameError, ObjectId};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying git object database
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// a referenced object is not present in the store
    #[error("object missing from store: {0}")]
    ObjectMissing(ObjectId),

    /// a referenced commit is not present in the store
    #[error("commit missing from store: {0}")]
    CommitMissing(CommitId),

    /// the branch for a repository does not exist
    #[error("branch not found: {0}")]
    BranchMissing(String),

    /// the branch for a repository already exists
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// an intermediate directory of the path does not exist
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// the terminal entry of the path does not exist
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// an entry with that name already exists
    #[error("entry already exists: {0}")]
    EntryExists(String),

    /// a path segment names a file where a directory is required
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// a stored object exists but cannot be decoded
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    /// invalid file or path name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the addressed thing doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectMissing(_)
                | StorageError::CommitMissing(_)
                | StorageError::BranchMissing(_)
                | StorageError::PathNotFound(_)
                | StorageError::EntryNotFound(_)
        )
    }

    /// check if this error means a referenced object is missing or unreadable,
    /// i.e. the repository graph itself is damaged
    pub fn is_missing_object(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectMissing(_)
                | StorageError::CommitMissing(_)
                | StorageError::CorruptObject { .. }
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
