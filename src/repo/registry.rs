//! In-memory repository descriptor cache.
//!
//! The engine keeps one [`RepoDescriptor`] per known repository: the
//! immutable identity fields plus the mutable flags (status, corrupted,
//! repair pending) held in atomics so concurrent operations can consult
//! them without locking. Descriptors are loaded lazily from the metadata
//! store and cached until evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::metadata::{EncParams, MetadataStore, RepoRow, RepoStatus};
use crate::repo::error::{RepoError, RepoResult};
use crate::storage::types::RepoId;

/// RepoStatus packed into an atomic.
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: RepoStatus) -> Self {
        Self(AtomicU8::new(Self::encode(status)))
    }

    fn encode(status: RepoStatus) -> u8 {
        match status {
            RepoStatus::Normal => 0,
            RepoStatus::ReadOnly => 1,
        }
    }

    fn get(&self) -> RepoStatus {
        match self.0.load(Ordering::Acquire) {
            0 => RepoStatus::Normal,
            _ => RepoStatus::ReadOnly,
        }
    }

    fn set(&self, status: RepoStatus) {
        self.0.store(Self::encode(status), Ordering::Release);
    }
}

/// Cached view of one repository.
pub struct RepoDescriptor {
    pub id: RepoId,
    pub name: String,
    pub owner: String,
    pub store_id: RepoId,
    pub enc: Option<EncParams>,
    pub format_version: u32,
    status: StatusCell,
    corrupted: AtomicBool,
    repair_pending: AtomicBool,
}

impl RepoDescriptor {
    fn from_row(row: &RepoRow) -> Self {
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            owner: row.owner.clone(),
            store_id: row.store_id.clone(),
            enc: row.enc.clone(),
            format_version: row.format_version,
            status: StatusCell::new(row.status),
            corrupted: AtomicBool::new(row.corrupted),
            repair_pending: AtomicBool::new(row.repair_pending),
        }
    }

    pub fn status(&self) -> RepoStatus {
        self.status.get()
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn is_repair_pending(&self) -> bool {
        self.repair_pending.load(Ordering::Acquire)
    }

    pub fn is_encrypted(&self) -> bool {
        self.enc.is_some()
    }
}

/// Lazily-populated descriptor cache over the metadata store.
pub struct RepoRegistry {
    metadata: Arc<dyn MetadataStore>,
    cache: RwLock<HashMap<RepoId, Arc<RepoDescriptor>>>,
}

impl RepoRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            metadata,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get the descriptor for a repository, loading it on first use.
    pub fn get(&self, id: &RepoId) -> RepoResult<Arc<RepoDescriptor>> {
        if let Some(desc) = self.cache.read().get(id) {
            return Ok(desc.clone());
        }

        let row = self
            .metadata
            .get_repo(id)?
            .ok_or_else(|| RepoError::NotFound(format!("repository {}", id)))?;

        let mut cache = self.cache.write();
        // another thread may have loaded it while we hit the metadata store
        if let Some(desc) = cache.get(id) {
            return Ok(desc.clone());
        }
        let desc = Arc::new(RepoDescriptor::from_row(&row));
        cache.insert(id.clone(), desc.clone());
        Ok(desc)
    }

    /// Register a freshly created repository and cache its descriptor.
    pub fn insert_row(&self, row: RepoRow) -> RepoResult<Arc<RepoDescriptor>> {
        let desc = Arc::new(RepoDescriptor::from_row(&row));
        self.metadata.register_repo(row)?;
        self.cache.write().insert(desc.id.clone(), desc.clone());
        Ok(desc)
    }

    /// Drop a repository from the cache (used on delete).
    pub fn remove(&self, id: &RepoId) {
        self.cache.write().remove(id);
    }

    /// Evict descriptors nobody else is holding.
    pub fn evict_idle(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, desc| Arc::strong_count(desc) > 1);
        before - cache.len()
    }

    /// Flag a repository corrupted, persisting the flag.
    pub fn mark_corrupted(&self, id: &RepoId) -> RepoResult<()> {
        tracing::warn!(repo = %id, "marking repository corrupted");
        self.metadata.set_corrupted(id, true)?;
        if let Some(desc) = self.cache.read().get(id) {
            desc.corrupted.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Change a repository's status, persisting it.
    pub fn set_status(&self, id: &RepoId, status: RepoStatus) -> RepoResult<()> {
        self.metadata.update_status(id, status)?;
        if let Some(desc) = self.cache.read().get(id) {
            desc.status.set(status);
        }
        Ok(())
    }
}
