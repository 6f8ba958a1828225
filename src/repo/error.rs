//! Engine-level errors.
//!
//! Storage errors get wrapped with repository and operation context before
//! they leave the engine. Not-found and invalid-operation cases are lifted
//! into their own variants so callers can branch without digging through
//! the source chain.

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::storage::error::StorageError;
use crate::storage::types::{InvalidNameError, RepoId};

#[derive(Debug, Error)]
pub enum RepoError {
    /// repository, path or commit does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// the operation is not valid against the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// invalid file name, path or repo id
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// the repository's status forbids this operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// the repository's object graph is damaged
    #[error("repository {0} is corrupted")]
    Corrupted(RepoId),

    /// a pinned-head mutation lost the race, or retries were exhausted
    #[error("concurrent modification of repository {repo}")]
    ConcurrentModification { repo: RepoId },

    /// a merge found the same paths changed incompatibly on both sides
    #[error("merge conflict at: {}", paths_display(.paths))]
    Conflict { paths: Vec<String> },

    /// metadata backend failure
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// storage failure with repository and operation context
    #[error("{context} in repository {repo}: {source}")]
    Store {
        repo: RepoId,
        context: String,
        #[source]
        source: StorageError,
    },
}

fn paths_display(paths: &[String]) -> String {
    paths
        .iter()
        .map(|p| format!("/{}", p))
        .collect::<Vec<_>>()
        .join(", ")
}

impl RepoError {
    /// Wrap a storage error, lifting addressing failures into engine variants.
    pub(crate) fn from_storage(repo: &RepoId, context: &str, e: StorageError) -> Self {
        match e {
            StorageError::BranchMissing(_) => {
                RepoError::NotFound(format!("repository {}", repo))
            }
            StorageError::PathNotFound(p) | StorageError::EntryNotFound(p) => {
                RepoError::NotFound(format!("/{}", p))
            }
            StorageError::EntryExists(p) => {
                RepoError::InvalidOperation(format!("/{} already exists", p))
            }
            StorageError::NotADirectory(p) => {
                RepoError::InvalidOperation(format!("/{} is not a directory", p))
            }
            StorageError::InvalidName(e) => RepoError::InvalidName(e),
            source => RepoError::Store {
                repo: repo.clone(),
                context: context.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::Conflict { .. })
    }

    /// whether re-running the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, RepoError::ConcurrentModification { .. })
    }

    /// whether this error means the repository graph is damaged and the
    /// repo should be flagged corrupted
    pub fn is_corruption(&self) -> bool {
        matches!(self, RepoError::Store { source, .. } if source.is_missing_object())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
