//! The repository engine.
//!
//! One engine instance owns a store pool, a descriptor registry and a
//! metadata store, and exposes the whole repository lifecycle: create,
//! mutate, browse, trash/restore, plus the virtual-repository and merge
//! operations implemented in sibling modules. The engine is cheap to clone
//! and safe to share across threads.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::metadata::{
    EncParams, MemoryMetadataStore, MetadataStore, RepoRow, RepoStatus, TrashRow,
};
use crate::repo::error::{RepoError, RepoResult};
use crate::repo::pipeline::{self, FileOp};
use crate::repo::registry::{RepoDescriptor, RepoRegistry};
use crate::storage::commit::{
    self, Commit, CommitBuilder, CommitMessage, History, REPO_FORMAT_VERSION,
};
use crate::storage::tree::{self, ChangeKind, Dirent};
use crate::storage::types::{Author, CommitId, FileId, FileName, RepoId, RepoPath, TreeId};
use crate::storage::{refs, ObjectStore, StorageError, StorePool};

/// a named entry in a directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub name: String,
    pub entry: Dirent,
}

/// one historical version of a file
#[derive(Debug, Clone)]
pub struct FileRevision {
    pub commit_id: CommitId,
    pub file: FileId,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    pub modifier: String,
}

/// a path that was deleted and not re-created since
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedEntry {
    pub path: String,
    pub commit_id: CommitId,
    pub deleted_at: DateTime<Utc>,
}

pub(crate) struct EngineInner {
    pub(crate) stores: StorePool,
    pub(crate) registry: RepoRegistry,
    pub(crate) metadata: Arc<dyn MetadataStore>,
}

/// Entry point for everything repositories.
#[derive(Clone)]
pub struct RepoEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl RepoEngine {
    pub fn new(store_root: impl AsRef<Path>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                stores: StorePool::new(store_root.as_ref()),
                registry: RepoRegistry::new(metadata.clone()),
                metadata,
            }),
        }
    }

    /// Engine over an in-memory metadata store. Handy for tests and tools.
    pub fn with_memory_metadata(store_root: impl AsRef<Path>) -> Self {
        Self::new(store_root, Arc::new(MemoryMetadataStore::new()))
    }

    // ---- lifecycle ----

    /// Create a repository: empty root tree, one root commit, a branch
    /// pointing at it, and a metadata row.
    pub fn create_repo(
        &self,
        name: &str,
        description: &str,
        owner: &str,
        enc: Option<EncParams>,
    ) -> RepoResult<RepoId> {
        let id = RepoId::generate();
        let store = self.store_err(&id, self.inner.stores.get(&id))?;

        let root = self.store_err(&id, tree::empty_tree_id(&store))?;
        let init = self.store_err(
            &id,
            CommitBuilder::new(Author::system())
                .root(root)
                .message(CommitMessage::init())
                .write(&store),
        )?;
        self.store_err(&id, refs::init_branch(&store, &id, init))?;

        self.inner.registry.insert_row(RepoRow {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            owner: owner.to_string(),
            store_id: id.clone(),
            status: RepoStatus::Normal,
            corrupted: false,
            repair_pending: false,
            enc,
            size_cache: 0,
            file_count_cache: 0,
            last_modify: Utc::now(),
            last_modifier: owner.to_string(),
            format_version: REPO_FORMAT_VERSION,
        })?;
        tracing::debug!(repo = %id, name, "repository created");
        Ok(id)
    }

    /// Delete a repository.
    ///
    /// Ordinary repositories go to the trash and can be restored; their
    /// objects stay in the store. Virtual repositories are dropped outright
    /// (their data lives in the origin's store and is not affected), and
    /// deleting an origin drops all virtual repositories carved out of it.
    pub fn delete_repo(&self, repo: &RepoId) -> RepoResult<()> {
        let desc = self.inner.registry.get(repo)?;
        let store = self.store_for(&desc)?;
        let is_virtual = self.inner.metadata.get_virtual(repo)?.is_some();

        if is_virtual {
            self.inner.metadata.remove_virtual(repo)?;
        } else {
            let row = self
                .inner
                .metadata
                .get_repo(repo)?
                .ok_or_else(|| RepoError::NotFound(format!("repository {}", repo)))?;
            let head = self.store_err(repo, refs::get_head(&store, repo))?;
            self.inner.metadata.insert_trash(TrashRow {
                repo: row,
                deleted_at: Utc::now(),
                head_commit_id: head,
            })?;
            // virtual repositories carved out of this one go with it; their
            // branches live in this store and would dangle otherwise
            for child in self.inner.metadata.list_virtual_by_origin(repo)? {
                match refs::delete_branch(&store, &child.repo_id) {
                    Ok(()) | Err(StorageError::BranchMissing(_)) => {}
                    Err(e) => {
                        return Err(RepoError::from_storage(&child.repo_id, "delete", e))
                    }
                }
                self.inner.metadata.remove_virtual(&child.repo_id)?;
                self.inner.metadata.remove_repo(&child.repo_id)?;
                self.inner.registry.remove(&child.repo_id);
                tracing::debug!(repo = %child.repo_id, origin = %repo, "virtual repository removed with origin");
            }
        }

        self.store_err(repo, refs::delete_branch(&store, repo))?;
        self.inner.metadata.remove_repo(repo)?;
        self.inner.registry.remove(repo);
        if desc.store_id == *repo {
            self.inner.stores.forget(repo);
        }
        tracing::debug!(repo = %repo, virtual = is_virtual, "repository deleted");
        Ok(())
    }

    /// Bring a repository back from the trash at its pre-deletion head.
    pub fn restore_repo(&self, repo: &RepoId) -> RepoResult<()> {
        let row = self
            .inner
            .metadata
            .take_trash(repo)?
            .ok_or_else(|| RepoError::NotFound(format!("repository {} in trash", repo)))?;

        let store = self.store_err(repo, self.inner.stores.get(&row.repo.store_id))?;
        self.store_err(repo, refs::init_branch(&store, repo, row.head_commit_id))?;
        self.inner.registry.insert_row(row.repo)?;
        tracing::debug!(repo = %repo, "repository restored from trash");
        Ok(())
    }

    pub fn list_trash(&self) -> RepoResult<Vec<TrashRow>> {
        Ok(self.inner.metadata.list_trash()?)
    }

    pub fn list_repos(&self) -> RepoResult<Vec<RepoRow>> {
        Ok(self.inner.metadata.list_repos()?)
    }

    pub fn repo_info(&self, repo: &RepoId) -> RepoResult<RepoRow> {
        self.inner
            .metadata
            .get_repo(repo)?
            .ok_or_else(|| RepoError::NotFound(format!("repository {}", repo)))
    }

    pub fn status(&self, repo: &RepoId) -> RepoResult<RepoStatus> {
        Ok(self.inner.registry.get(repo)?.status())
    }

    pub fn set_status(&self, repo: &RepoId, status: RepoStatus) -> RepoResult<()> {
        self.inner.registry.get(repo)?;
        self.inner.registry.set_status(repo, status)
    }

    // ---- mutations ----

    /// Add a new file. `content` is stored as one object; the commit lands
    /// on the current head with retries on contention.
    pub fn post_file(
        &self,
        repo: &RepoId,
        parent_dir: &str,
        name: &str,
        content: &[u8],
        replace_existing: bool,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let dir = RepoPath::new(parent_dir)?;
        let name = FileName::new(name)?;
        let store = self.writable(repo)?;
        let (file, size) = self.put_blob(repo, &store, content)?;
        self.mutate(
            repo,
            None,
            FileOp::PostFile {
                dir,
                name,
                file,
                size,
                replace_existing,
            },
            author,
        )
    }

    /// Update an existing file's content.
    ///
    /// `expected_head` pins the mutation to a specific head (no retries);
    /// `expected_file` rejects the update if the file changed since the
    /// caller last read it. Either check failing surfaces as
    /// [`RepoError::ConcurrentModification`].
    pub fn put_file(
        &self,
        repo: &RepoId,
        path: &str,
        content: &[u8],
        expected_head: Option<CommitId>,
        expected_file: Option<FileId>,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let path = RepoPath::new(path)?;
        let store = self.writable(repo)?;
        let (file, size) = self.put_blob(repo, &store, content)?;
        self.mutate(
            repo,
            expected_head,
            FileOp::PutFile {
                path,
                file,
                size,
                expected_file_id: expected_file,
            },
            author,
        )
    }

    /// Remove a file or a whole directory.
    pub fn delete_entry(&self, repo: &RepoId, path: &str, author: &Author) -> RepoResult<CommitId> {
        let path = RepoPath::new(path)?;
        if path.is_root() {
            return Err(RepoError::InvalidOperation(
                "cannot delete the root directory".to_string(),
            ));
        }
        self.mutate(repo, None, FileOp::Delete { path }, author)
    }

    /// Rename an entry within its directory.
    pub fn rename_entry(
        &self,
        repo: &RepoId,
        parent_dir: &str,
        from: &str,
        to: &str,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let dir = RepoPath::new(parent_dir)?;
        let from = FileName::new(from)?;
        let to = FileName::new(to)?;
        self.mutate(repo, None, FileOp::Rename { dir, from, to }, author)
    }

    /// Create an empty directory.
    pub fn mkdir(
        &self,
        repo: &RepoId,
        parent_dir: &str,
        name: &str,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let dir = RepoPath::new(parent_dir)?;
        let name = FileName::new(name)?;
        self.mutate(repo, None, FileOp::Mkdir { dir, name }, author)
    }

    /// Create a directory and any missing ancestors. Idempotent.
    pub fn mkdir_with_parents(
        &self,
        repo: &RepoId,
        path: &str,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let path = RepoPath::new(path)?;
        if path.is_root() {
            return self.head(repo);
        }
        self.mutate(repo, None, FileOp::MkdirWithParents { path }, author)
    }

    /// Copy an entry (file or directory) into a directory, possibly of
    /// another repository. Trees are immutable, so a directory copy shares
    /// the source's objects instead of duplicating them.
    pub fn copy_entry(
        &self,
        src_repo: &RepoId,
        src_path: &str,
        dst_repo: &RepoId,
        dst_dir: &str,
        dst_name: &str,
        replace_existing: bool,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let (entry, _) = self.source_entry(src_repo, src_path)?;
        let op = FileOp::CopyIn {
            dir: RepoPath::new(dst_dir)?,
            name: FileName::new(dst_name)?,
            entry,
            replace_existing,
            remove_source: None,
        };
        if src_repo != dst_repo {
            self.import_entry(src_repo, dst_repo, &entry)?;
        }
        self.mutate(dst_repo, None, op, author)
    }

    /// Move an entry. Within one repository this is a single commit; across
    /// repositories it is a copy into the destination followed by a delete
    /// in the source (two commits).
    pub fn move_entry(
        &self,
        src_repo: &RepoId,
        src_path: &str,
        dst_repo: &RepoId,
        dst_dir: &str,
        dst_name: &str,
        replace_existing: bool,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let (entry, src_path) = self.source_entry(src_repo, src_path)?;
        let dst_dir = RepoPath::new(dst_dir)?;
        if entry.is_dir()
            && src_repo == dst_repo
            && (dst_dir == src_path || dst_dir.as_str().starts_with(&format!("{}/", src_path.as_str())))
        {
            return Err(RepoError::InvalidOperation(format!(
                "cannot move {} into itself",
                src_path
            )));
        }

        if src_repo == dst_repo {
            return self.mutate(
                dst_repo,
                None,
                FileOp::CopyIn {
                    dir: dst_dir,
                    name: FileName::new(dst_name)?,
                    entry,
                    replace_existing,
                    remove_source: Some(src_path),
                },
                author,
            );
        }

        self.import_entry(src_repo, dst_repo, &entry)?;
        let head = self.mutate(
            dst_repo,
            None,
            FileOp::CopyIn {
                dir: dst_dir,
                name: FileName::new(dst_name)?,
                entry,
                replace_existing,
                remove_source: None,
            },
            author,
        )?;
        self.mutate(src_repo, None, FileOp::Delete { path: src_path }, author)?;
        Ok(head)
    }

    /// Restore a path to its state at a historical commit. If the path did
    /// not exist there, it is deleted.
    pub fn revert_entry(
        &self,
        repo: &RepoId,
        path: &str,
        target: CommitId,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let path = RepoPath::new(path)?;
        let store = self.writable(repo)?;
        let historical = commit::get_commit(&store, target)
            .map_err(|_| RepoError::NotFound(format!("commit {}", target)))?;
        let entry = self.flag_corruption(
            repo,
            tree::resolve(&store, historical.root, &path)
                .map_err(|e| RepoError::from_storage(repo, "revert", e)),
        )?;
        self.mutate(
            repo,
            None,
            FileOp::Revert {
                path,
                entry,
                target,
            },
            author,
        )
    }

    // ---- browsing ----

    /// Current head commit of a repository's branch.
    pub fn head(&self, repo: &RepoId) -> RepoResult<CommitId> {
        let store = self.readable(repo)?;
        self.flag_corruption(
            repo,
            refs::get_head(&store, repo).map_err(|e| RepoError::from_storage(repo, "head", e)),
        )
    }

    /// Load a commit by id.
    pub fn commit(&self, repo: &RepoId, id: CommitId) -> RepoResult<Commit> {
        let store = self.readable(repo)?;
        self.flag_corruption(
            repo,
            commit::get_commit(&store, id)
                .map_err(|e| RepoError::from_storage(repo, "load commit", e)),
        )
    }

    /// List a directory at the current head, sorted by name.
    pub fn list_dir(&self, repo: &RepoId, path: &str) -> RepoResult<Vec<EntryInfo>> {
        let path = RepoPath::new(path)?;
        let store = self.readable(repo)?;
        let root = self.head_root(repo, &store)?;
        self.flag_corruption(repo, {
            let wrap = |e| RepoError::from_storage(repo, "list directory", e);
            (|| {
                let entry = tree::resolve(&store, root, &path)
                    .map_err(wrap)?
                    .ok_or_else(|| RepoError::NotFound(path.to_string()))?;
                let tree_id = entry.tree_id().ok_or_else(|| {
                    RepoError::InvalidOperation(format!("{} is not a directory", path))
                })?;
                let dir = tree::Tree::load(&store, tree_id).map_err(wrap)?;
                Ok(dir
                    .iter()
                    .map(|(name, entry)| EntryInfo {
                        name: name.to_string(),
                        entry: *entry,
                    })
                    .collect())
            })()
        })
    }

    /// Look up a single entry at the current head.
    pub fn stat_entry(&self, repo: &RepoId, path: &str) -> RepoResult<Dirent> {
        let path = RepoPath::new(path)?;
        let store = self.readable(repo)?;
        let root = self.head_root(repo, &store)?;
        self.flag_corruption(
            repo,
            tree::resolve(&store, root, &path)
                .map_err(|e| RepoError::from_storage(repo, "stat", e)),
        )?
        .ok_or_else(|| RepoError::NotFound(path.to_string()))
    }

    /// Read a file's content at the current head.
    pub fn read_file(&self, repo: &RepoId, path: &str) -> RepoResult<Vec<u8>> {
        let entry = self.stat_entry(repo, path)?;
        let file = entry.file_id().ok_or_else(|| {
            RepoError::InvalidOperation(format!("/{} is a directory", path.trim_matches('/')))
        })?;
        let store = self.readable(repo)?;
        self.flag_corruption(
            repo,
            store
                .get(file.as_object())
                .map_err(|e| RepoError::from_storage(repo, "read file", e)),
        )
    }

    /// Walk history from the head, newest first, up to `limit` commits.
    pub fn history(&self, repo: &RepoId, limit: usize) -> RepoResult<Vec<(CommitId, Commit)>> {
        let store = self.readable(repo)?;
        let head = self.head(repo)?;
        self.flag_corruption(
            repo,
            History::new(&store, head)
                .take(limit)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RepoError::from_storage(repo, "history", e)),
        )
    }

    /// Commits at which a file's content changed, newest first.
    pub fn list_file_revisions(
        &self,
        repo: &RepoId,
        path: &str,
        limit: usize,
    ) -> RepoResult<Vec<FileRevision>> {
        let path = RepoPath::new(path)?;
        let store = self.readable(repo)?;
        let head = self.head(repo)?;
        let wrap = |e| RepoError::from_storage(repo, "file revisions", e);

        let result = (|| {
            let mut revisions = Vec::new();
            for item in History::new(&store, head) {
                if revisions.len() >= limit {
                    break;
                }
                let (commit_id, commit) = item.map_err(wrap)?;
                let here = tree::resolve(&store, commit.root, &path).map_err(wrap)?;
                let (file, size) = match here {
                    Some(Dirent::File { id, size, .. }) => (id, size),
                    _ => continue,
                };
                let in_parent = match commit.first_parent() {
                    Some(parent) => {
                        let parent = commit::get_commit(&store, parent).map_err(wrap)?;
                        tree::resolve(&store, parent.root, &path).map_err(wrap)?
                    }
                    None => None,
                };
                let changed = !matches!(in_parent, Some(Dirent::File { id, .. }) if id == file);
                if changed {
                    revisions.push(FileRevision {
                        commit_id,
                        file,
                        size,
                        timestamp: commit.timestamp,
                        modifier: commit.author.name.clone(),
                    });
                }
            }
            Ok(revisions)
        })();
        let revisions: Vec<FileRevision> = self.flag_corruption(repo, result)?;
        if revisions.is_empty() {
            return Err(RepoError::NotFound(path.to_string()));
        }
        Ok(revisions)
    }

    /// Paths deleted within the last `scan_limit` commits and not re-created
    /// since, newest deletion first.
    pub fn list_deleted(&self, repo: &RepoId, scan_limit: usize) -> RepoResult<Vec<DeletedEntry>> {
        let store = self.readable(repo)?;
        let head = self.head(repo)?;
        let wrap = |e| RepoError::from_storage(repo, "list deleted", e);

        let result = (|| {
            let head_root = commit::get_commit(&store, head).map_err(wrap)?.root;
            let mut seen = std::collections::HashSet::new();
            let mut deleted = Vec::new();
            for item in History::new(&store, head).take(scan_limit) {
                let (commit_id, commit) = item.map_err(wrap)?;
                let parent = match commit.first_parent() {
                    Some(p) => commit::get_commit(&store, p).map_err(wrap)?,
                    None => break,
                };
                for change in tree::diff(&store, parent.root, commit.root).map_err(wrap)? {
                    if change.kind != ChangeKind::Deleted || !seen.insert(change.path.clone()) {
                        continue;
                    }
                    let path = RepoPath::new(&change.path)?;
                    if tree::resolve(&store, head_root, &path).map_err(wrap)?.is_none() {
                        deleted.push(DeletedEntry {
                            path: change.path,
                            commit_id,
                            deleted_at: commit.timestamp,
                        });
                    }
                }
            }
            Ok(deleted)
        })();
        self.flag_corruption(repo, result)
    }

    /// Walk the head tree, count bytes and files, and refresh the cached
    /// numbers in metadata. Returns `(bytes, files)`.
    pub fn compute_size(&self, repo: &RepoId) -> RepoResult<(u64, u64)> {
        let store = self.readable(repo)?;
        let root = self.head_root(repo, &store)?;
        let (bytes, files) = self.flag_corruption(
            repo,
            tree::size_of(&store, root)
                .map_err(|e| RepoError::from_storage(repo, "compute size", e)),
        )?;
        self.inner.metadata.update_size_cache(repo, bytes, files)?;
        Ok((bytes, files))
    }

    // ---- internals ----

    pub(crate) fn readable(&self, repo: &RepoId) -> RepoResult<ObjectStore> {
        let desc = self.inner.registry.get(repo)?;
        if desc.is_corrupted() {
            return Err(RepoError::Corrupted(repo.clone()));
        }
        self.store_for(&desc)
    }

    pub(crate) fn writable(&self, repo: &RepoId) -> RepoResult<ObjectStore> {
        let desc = self.inner.registry.get(repo)?;
        if desc.is_corrupted() {
            return Err(RepoError::Corrupted(repo.clone()));
        }
        if desc.status() == RepoStatus::ReadOnly {
            return Err(RepoError::PermissionDenied(format!(
                "repository {} is read-only",
                repo
            )));
        }
        self.store_for(&desc)
    }

    pub(crate) fn store_for(&self, desc: &RepoDescriptor) -> RepoResult<ObjectStore> {
        self.store_err(&desc.id, self.inner.stores.get(&desc.store_id))
    }

    pub(crate) fn store_err<T>(
        &self,
        repo: &RepoId,
        result: crate::storage::StorageResult<T>,
    ) -> RepoResult<T> {
        result.map_err(|e| RepoError::from_storage(repo, "storage", e))
    }

    /// Translate graph damage into a persistent corrupted flag.
    pub(crate) fn flag_corruption<T>(&self, repo: &RepoId, result: RepoResult<T>) -> RepoResult<T> {
        match result {
            Err(e) if e.is_corruption() => {
                self.inner.registry.mark_corrupted(repo)?;
                Err(RepoError::Corrupted(repo.clone()))
            }
            other => other,
        }
    }

    /// Run one mutation through the pipeline with status gates and
    /// last-modified bookkeeping.
    pub(crate) fn mutate(
        &self,
        repo: &RepoId,
        expected_head: Option<CommitId>,
        op: FileOp,
        author: &Author,
    ) -> RepoResult<CommitId> {
        let store = self.writable(repo)?;
        let result = pipeline::commit_mutation(&store, repo, expected_head, &op, author);
        let head = self.flag_corruption(repo, result)?;
        self.inner.metadata.touch_repo(repo, &author.name, Utc::now())?;
        Ok(head)
    }

    fn put_blob(
        &self,
        repo: &RepoId,
        store: &ObjectStore,
        content: &[u8],
    ) -> RepoResult<(FileId, u64)> {
        let id = self.store_err(repo, store.put(content))?;
        Ok((FileId::new(id.raw()), content.len() as u64))
    }

    pub(crate) fn head_root(&self, repo: &RepoId, store: &ObjectStore) -> RepoResult<TreeId> {
        let head = self.flag_corruption(
            repo,
            refs::get_head(store, repo).map_err(|e| RepoError::from_storage(repo, "head", e)),
        )?;
        let commit = self.flag_corruption(
            repo,
            commit::get_commit(store, head)
                .map_err(|e| RepoError::from_storage(repo, "head commit", e)),
        )?;
        Ok(commit.root)
    }

    /// Resolve the entry to copy/move out of a source repository.
    fn source_entry(&self, repo: &RepoId, path: &str) -> RepoResult<(Dirent, RepoPath)> {
        let path = RepoPath::new(path)?;
        if path.is_root() {
            return Err(RepoError::InvalidOperation(
                "cannot copy or move the root directory".to_string(),
            ));
        }
        let entry = self.stat_entry(repo, path.as_str())?;
        Ok((entry, path))
    }

    /// Make an entry's objects available in the destination repo's store.
    fn import_entry(&self, src: &RepoId, dst: &RepoId, entry: &Dirent) -> RepoResult<()> {
        let src_store = self.readable(src)?;
        let dst_store = self.writable(dst)?;
        if src_store.id() == dst_store.id() {
            return Ok(());
        }
        self.flag_corruption(
            src,
            tree::copy_between(&src_store, &dst_store, entry)
                .map_err(|e| RepoError::from_storage(src, "copy objects", e)),
        )?;
        Ok(())
    }
}
