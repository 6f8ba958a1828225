//! Virtual repositories.
//!
//! A virtual repository exposes one subtree of an origin repository as a
//! full repository of its own. It gets its own id, branch and commit
//! history, but no store: every object resolves through the origin's
//! store, so creating one writes a single seed commit and copies nothing.
//! The mapping row remembers the origin, the shared path and the last
//! origin commit both sides agree on (the merge base).

use crate::metadata::{RepoRow, RepoStatus, VirtualRepoRow};
use crate::repo::engine::RepoEngine;
use crate::repo::error::{RepoError, RepoResult};
use crate::storage::commit::{CommitBuilder, CommitMessage, REPO_FORMAT_VERSION};
use crate::storage::tree::{self, Dirent};
use crate::storage::types::{Author, RepoId, RepoPath, TreeId};
use crate::storage::{refs, ObjectStore};
use chrono::Utc;

impl RepoEngine {
    /// Expose `path` of `origin` as a new repository.
    ///
    /// The path must name an existing directory below the origin's root at
    /// its current head. Virtual repositories of virtual repositories are
    /// not allowed.
    pub fn create_virtual_repo(
        &self,
        origin: &RepoId,
        path: &str,
        name: &str,
        description: &str,
        owner: &str,
    ) -> RepoResult<RepoId> {
        if self.inner.metadata.get_virtual(origin)?.is_some() {
            return Err(RepoError::InvalidOperation(
                "cannot create a virtual repository of a virtual repository".to_string(),
            ));
        }
        let path = RepoPath::new(path)?;
        if path.is_root() {
            return Err(RepoError::InvalidOperation(
                "a virtual repository must map a subtree, not the root".to_string(),
            ));
        }
        let origin_row = self.repo_info(origin)?;
        let store = self.readable(origin)?;
        let origin_head = self.store_err(origin, refs::get_head(&store, origin))?;
        let subtree = self.subtree_at(origin, &store, origin_head, &path)?;

        let id = RepoId::generate();
        let seed = self.store_err(
            &id,
            CommitBuilder::new(Author::system())
                .root(subtree)
                .message(CommitMessage::seed_virtual(origin.as_str(), path.as_str()))
                .write(&store),
        )?;
        self.store_err(&id, refs::init_branch(&store, &id, seed))?;

        self.inner.metadata.insert_virtual(VirtualRepoRow {
            repo_id: id.clone(),
            origin_repo_id: origin.clone(),
            path: path.as_str().to_string(),
            base_commit_id: origin_head,
        })?;
        self.inner.registry.insert_row(RepoRow {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            owner: owner.to_string(),
            store_id: origin.clone(),
            status: RepoStatus::Normal,
            corrupted: false,
            repair_pending: false,
            // an encrypted origin keeps its parameters on the virtual side
            enc: origin_row.enc.clone(),
            size_cache: 0,
            file_count_cache: 0,
            last_modify: Utc::now(),
            last_modifier: owner.to_string(),
            format_version: REPO_FORMAT_VERSION,
        })?;
        tracing::debug!(repo = %id, origin = %origin, path = %path, "virtual repository created");
        Ok(id)
    }

    /// The virtual-repository mapping for a repo, if it is virtual.
    pub fn virtual_info(&self, repo: &RepoId) -> RepoResult<Option<VirtualRepoRow>> {
        Ok(self.inner.metadata.get_virtual(repo)?)
    }

    /// Drop virtual repositories whose shared folder no longer exists.
    ///
    /// A virtual repo is orphaned when its origin was deleted, or when the
    /// shared path at the origin's head is gone or no longer a directory.
    /// Returns how many were removed.
    pub fn cleanup_orphaned_virtual(&self, origin: &RepoId) -> RepoResult<usize> {
        let rows = self.inner.metadata.list_virtual_by_origin(origin)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let origin_view = match self.inner.metadata.get_repo(origin)? {
            Some(_) => {
                let store = self.readable(origin)?;
                let root = self.head_root(origin, &store)?;
                Some((store, root))
            }
            None => None,
        };

        let mut removed = 0;
        for row in rows {
            let orphaned = match &origin_view {
                None => true,
                Some((store, root)) => {
                    let path = RepoPath::new(&row.path)?;
                    !matches!(
                        self.flag_corruption(
                            origin,
                            tree::resolve(store, *root, &path)
                                .map_err(|e| RepoError::from_storage(origin, "cleanup", e)),
                        )?,
                        Some(Dirent::Dir { .. })
                    )
                }
            };
            if !orphaned {
                continue;
            }

            if let Some((store, _)) = &origin_view {
                match refs::delete_branch(store, &row.repo_id) {
                    Ok(()) | Err(crate::storage::StorageError::BranchMissing(_)) => {}
                    Err(e) => return Err(RepoError::from_storage(&row.repo_id, "cleanup", e)),
                }
            }
            self.inner.metadata.remove_virtual(&row.repo_id)?;
            self.inner.metadata.remove_repo(&row.repo_id)?;
            self.inner.registry.remove(&row.repo_id);
            tracing::debug!(repo = %row.repo_id, origin = %origin, "orphaned virtual repository removed");
            removed += 1;
        }
        Ok(removed)
    }

    /// Resolve the shared subtree of a commit, by origin-relative path.
    pub(crate) fn subtree_at(
        &self,
        origin: &RepoId,
        store: &ObjectStore,
        commit: crate::storage::types::CommitId,
        path: &RepoPath,
    ) -> RepoResult<TreeId> {
        let root = self
            .flag_corruption(
                origin,
                crate::storage::commit::get_commit(store, commit)
                    .map_err(|e| RepoError::from_storage(origin, "load commit", e)),
            )?
            .root;
        if path.is_root() {
            return Ok(root);
        }
        match self.flag_corruption(
            origin,
            tree::resolve(store, root, path)
                .map_err(|e| RepoError::from_storage(origin, "resolve subtree", e)),
        )? {
            Some(Dirent::Dir { id }) => Ok(id),
            Some(Dirent::File { .. }) => Err(RepoError::InvalidOperation(format!(
                "{} is not a directory",
                path
            ))),
            None => Err(RepoError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RepoEngine, RepoId) {
        let dir = TempDir::new().unwrap();
        let engine = RepoEngine::with_memory_metadata(dir.path().join("stores"));
        let origin = engine
            .create_repo("origin", "", "alice", None)
            .unwrap();
        engine
            .mkdir_with_parents(&origin, "shared/docs", &Author::system())
            .unwrap();
        engine
            .post_file(
                &origin,
                "shared/docs",
                "a.txt",
                b"shared content",
                false,
                &Author::system(),
            )
            .unwrap();
        (dir, engine, origin)
    }

    #[test]
    fn test_virtual_repo_sees_subtree() {
        let (_dir, engine, origin) = setup();
        let v = engine
            .create_virtual_repo(&origin, "shared", "share", "", "bob")
            .unwrap();

        // the virtual root is the origin's subtree, object for object
        assert_eq!(engine.read_file(&v, "docs/a.txt").unwrap(), b"shared content");
        let listing = engine.list_dir(&v, "").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "docs");

        // shares the origin's store
        let info = engine.repo_info(&v).unwrap();
        assert_eq!(info.store_id, origin);

        let mapping = engine.virtual_info(&v).unwrap().unwrap();
        assert_eq!(mapping.origin_repo_id, origin);
        assert_eq!(mapping.path, "shared");
        assert_eq!(mapping.base_commit_id, engine.head(&origin).unwrap());
    }

    #[test]
    fn test_virtual_repo_requires_directory() {
        let (_dir, engine, origin) = setup();

        let result = engine.create_virtual_repo(&origin, "missing", "x", "", "bob");
        assert!(matches!(result, Err(RepoError::NotFound(_))));

        let result =
            engine.create_virtual_repo(&origin, "shared/docs/a.txt", "x", "", "bob");
        assert!(matches!(result, Err(RepoError::InvalidOperation(_))));
    }

    #[test]
    fn test_no_nested_virtual_repos() {
        let (_dir, engine, origin) = setup();
        let v = engine
            .create_virtual_repo(&origin, "shared", "share", "", "bob")
            .unwrap();

        let result = engine.create_virtual_repo(&v, "docs", "nested", "", "bob");
        assert!(matches!(result, Err(RepoError::InvalidOperation(_))));
    }

    #[test]
    fn test_cleanup_orphaned_after_folder_deletion() {
        let (_dir, engine, origin) = setup();
        let v1 = engine
            .create_virtual_repo(&origin, "shared/docs", "docs", "", "bob")
            .unwrap();
        let v2 = engine
            .create_virtual_repo(&origin, "shared", "share", "", "carol")
            .unwrap();

        // nothing orphaned yet
        assert_eq!(engine.cleanup_orphaned_virtual(&origin).unwrap(), 0);

        engine
            .delete_entry(&origin, "shared/docs", &Author::system())
            .unwrap();
        assert_eq!(engine.cleanup_orphaned_virtual(&origin).unwrap(), 1);
        assert!(engine.virtual_info(&v1).unwrap().is_none());
        assert!(matches!(
            engine.head(&v1),
            Err(RepoError::NotFound(_))
        ));
        // the surviving share is untouched
        assert!(engine.virtual_info(&v2).unwrap().is_some());
        assert!(engine.head(&v2).is_ok());
    }
}
