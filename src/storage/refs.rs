//! Branch head management.
//!
//! Every repository has exactly one branch, stored as a git ref named after
//! the repository id. The head is the only mutable piece of state in the
//! storage layer, and the only way to move it is [`cas_head`]: compare the
//! current target against an expected commit and swap atomically under the
//! store's lock. Everything the pipeline does funnels through that single
//! compare-and-swap.

use git2::Repository;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::ObjectStore;
use crate::storage::types::{CommitId, RepoId};

/// Ref name for a repository's single branch.
pub fn branch_ref(repo_id: &RepoId) -> String {
    format!("refs/heads/{}", repo_id.as_str())
}

fn read_head(repo: &Repository, name: &str) -> StorageResult<CommitId> {
    match repo.find_reference(name) {
        Ok(reference) => {
            let oid = reference
                .target()
                .ok_or_else(|| StorageError::Internal(format!("{} is not a direct ref", name)))?;
            Ok(CommitId::new(oid))
        }
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            Err(StorageError::BranchMissing(name.to_string()))
        }
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// Read the current head of a repository's branch.
pub fn get_head(store: &ObjectStore, repo_id: &RepoId) -> StorageResult<CommitId> {
    let name = branch_ref(repo_id);
    store.with_repo(|repo| read_head(repo, &name))
}

/// Check whether a repository's branch exists.
pub fn branch_exists(store: &ObjectStore, repo_id: &RepoId) -> StorageResult<bool> {
    match get_head(store, repo_id) {
        Ok(_) => Ok(true),
        Err(StorageError::BranchMissing(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create a repository's branch pointing at its initial commit.
///
/// Fails with [`StorageError::BranchExists`] if the branch is already there.
pub fn init_branch(store: &ObjectStore, repo_id: &RepoId, head: CommitId) -> StorageResult<()> {
    let name = branch_ref(repo_id);
    store.with_repo(|repo| {
        if repo.find_reference(&name).is_ok() {
            return Err(StorageError::BranchExists(name.clone()));
        }
        repo.reference(&name, head.raw(), false, "branch created")?;
        Ok(())
    })
}

/// Atomically move a branch head from `expected` to `new`.
///
/// Returns `Ok(true)` on success, `Ok(false)` when the head no longer equals
/// `expected` (someone else committed first). The caller decides whether to
/// rebase and retry or surface the collision.
pub fn cas_head(
    store: &ObjectStore,
    repo_id: &RepoId,
    expected: CommitId,
    new: CommitId,
) -> StorageResult<bool> {
    let name = branch_ref(repo_id);
    store.with_repo(|repo| {
        let current = read_head(repo, &name)?;
        if current != expected {
            return Ok(false);
        }
        repo.reference(&name, new.raw(), true, "head updated")?;
        Ok(true)
    })
}

/// Delete a repository's branch. Objects stay in the store.
pub fn delete_branch(store: &ObjectStore, repo_id: &RepoId) -> StorageResult<()> {
    let name = branch_ref(repo_id);
    store.with_repo(|repo| {
        let mut reference = match repo.find_reference(&name) {
            Ok(r) => r,
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                return Err(StorageError::BranchMissing(name.clone()))
            }
            Err(e) => return Err(StorageError::Git(e)),
        };
        reference.delete()?;
        Ok(())
    })
}
