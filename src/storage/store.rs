//! Object store adapter.
//!
//! Each store is a bare git object database addressed by a store id. Trees
//! and commits are serialized blobs, so identity is the SHA-1 of the content
//! and deduplication across commits comes for free. A virtual repository has
//! no store of its own; its objects resolve through its origin's store.
//!
//! The upper layers never touch `git2` directly — they go through
//! [`ObjectStore`] (get/put/exists by hash) and the ref helpers in
//! [`crate::storage::refs`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::{Mutex, RwLock};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ObjectId, RepoId};

/// Handle to one content-addressed store.
///
/// Clone to share across threads - it uses Arc internally. All access to the
/// underlying git repository goes through one mutex (`git2::Repository` is
/// not Sync), which is also what makes compare-and-swap on branch heads
/// atomic within the process.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<ObjectStoreInner>,
}

struct ObjectStoreInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    id: RepoId,
}

impl ObjectStore {
    /// Open an existing store.
    pub fn open(id: RepoId, path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path)?;
        Ok(Self {
            inner: Arc::new(ObjectStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                id,
            }),
        })
    }

    /// Create a new (bare) store.
    pub fn create(id: RepoId, path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init_bare(path)?;
        Ok(Self {
            inner: Arc::new(ObjectStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                id,
            }),
        })
    }

    /// Open a store, creating it if absent.
    pub fn open_or_create(id: RepoId, path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(id, path)
        } else {
            Self::create(id, path)
        }
    }

    /// The store id (the repo id of the owning repository).
    pub fn id(&self) -> &RepoId {
        &self.inner.id
    }

    /// The on-disk location.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Write an object; returns its content address.
    pub fn put(&self, bytes: &[u8]) -> StorageResult<ObjectId> {
        let repo = self.inner.repo.lock();
        let oid = repo.blob(bytes)?;
        Ok(ObjectId::new(oid))
    }

    /// Read an object by content address.
    pub fn get(&self, id: ObjectId) -> StorageResult<Vec<u8>> {
        let repo = self.inner.repo.lock();
        // bound to a local so the blob drops before the guard
        let result = match repo.find_blob(id.raw()) {
            Ok(blob) => Ok(blob.content().to_vec()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                Err(StorageError::ObjectMissing(id))
            }
            Err(e) => Err(StorageError::Git(e)),
        };
        result
    }

    /// Check whether an object exists without reading it.
    pub fn exists(&self, id: ObjectId) -> StorageResult<bool> {
        let repo = self.inner.repo.lock();
        let present = repo.odb()?.exists(id.raw());
        Ok(present)
    }

    /// Execute a function with exclusive access to the underlying repository.
    pub(crate) fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Opens stores under a root directory and caches the handles.
///
/// Keyed by store id: an ordinary repository maps to its own store, a virtual
/// repository maps to its origin's.
pub struct StorePool {
    root: PathBuf,
    open: RwLock<HashMap<RepoId, ObjectStore>>,
}

impl StorePool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: RwLock::new(HashMap::new()),
        }
    }

    fn store_path(&self, store_id: &RepoId) -> PathBuf {
        self.root.join(store_id.as_str())
    }

    /// Get the store for a store id, opening or creating it on first use.
    pub fn get(&self, store_id: &RepoId) -> StorageResult<ObjectStore> {
        if let Some(store) = self.open.read().get(store_id) {
            return Ok(store.clone());
        }

        let mut open = self.open.write();
        // another thread may have opened it while we waited for the lock
        if let Some(store) = open.get(store_id) {
            return Ok(store.clone());
        }
        let store = ObjectStore::open_or_create(store_id.clone(), self.store_path(store_id))?;
        open.insert(store_id.clone(), store.clone());
        Ok(store)
    }

    /// Drop the cached handle for a store (the on-disk data is left alone).
    pub fn forget(&self, store_id: &RepoId) {
        self.open.write().remove(store_id);
    }
}
