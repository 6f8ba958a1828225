//! Repository metadata store.
//!
//! Everything about a repository that is not part of its commit graph lives
//! here: name, owner, status flags, size caches, the virtual-repository
//! mapping and the trash. The engine talks to a [`MetadataStore`] trait so
//! the backing can be swapped; [`MemoryMetadataStore`] is the in-process
//! implementation used by the engine's `with_memory_metadata` constructor
//! and by the tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::types::{CommitId, RepoId};

/// error from the metadata backend
#[derive(Debug, Error)]
#[error("metadata error: {0}")]
pub struct MetadataError(pub String);

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Mutable repository status. Orthogonal to the corruption flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    /// reads and writes allowed
    Normal,
    /// reads allowed, mutations rejected
    ReadOnly,
}

/// Encryption parameters carried alongside an encrypted repository.
///
/// The engine stores and returns these opaquely; key derivation and content
/// encryption happen client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncParams {
    pub version: u32,
    pub salt: String,
    pub verify: String,
    pub wrapped_key: Vec<u8>,
}

/// One repository's metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRow {
    pub id: RepoId,
    pub name: String,
    pub description: String,
    pub owner: String,
    /// where this repo's objects live; equals `id` unless the repo is virtual
    pub store_id: RepoId,
    pub status: RepoStatus,
    pub corrupted: bool,
    pub repair_pending: bool,
    pub enc: Option<EncParams>,
    pub size_cache: u64,
    pub file_count_cache: u64,
    pub last_modify: DateTime<Utc>,
    pub last_modifier: String,
    pub format_version: u32,
}

/// Virtual-repository mapping row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRepoRow {
    pub repo_id: RepoId,
    pub origin_repo_id: RepoId,
    /// origin-relative path of the shared subtree ("" for the root)
    pub path: String,
    /// last origin commit both sides agree on
    pub base_commit_id: CommitId,
}

/// A deleted repository waiting in the trash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashRow {
    pub repo: RepoRow,
    pub deleted_at: DateTime<Utc>,
    pub head_commit_id: CommitId,
}

/// Backend-agnostic metadata operations.
pub trait MetadataStore: Send + Sync {
    fn register_repo(&self, row: RepoRow) -> MetadataResult<()>;
    fn get_repo(&self, id: &RepoId) -> MetadataResult<Option<RepoRow>>;
    fn list_repos(&self) -> MetadataResult<Vec<RepoRow>>;
    fn remove_repo(&self, id: &RepoId) -> MetadataResult<()>;
    fn update_status(&self, id: &RepoId, status: RepoStatus) -> MetadataResult<()>;
    fn set_corrupted(&self, id: &RepoId, corrupted: bool) -> MetadataResult<()>;
    fn set_repair_pending(&self, id: &RepoId, pending: bool) -> MetadataResult<()>;
    fn update_size_cache(&self, id: &RepoId, size: u64, file_count: u64) -> MetadataResult<()>;
    fn touch_repo(&self, id: &RepoId, modifier: &str, at: DateTime<Utc>) -> MetadataResult<()>;

    fn insert_virtual(&self, row: VirtualRepoRow) -> MetadataResult<()>;
    fn get_virtual(&self, repo_id: &RepoId) -> MetadataResult<Option<VirtualRepoRow>>;
    fn list_virtual_by_origin(&self, origin: &RepoId) -> MetadataResult<Vec<VirtualRepoRow>>;
    fn update_virtual_base(&self, repo_id: &RepoId, base: CommitId) -> MetadataResult<()>;
    fn remove_virtual(&self, repo_id: &RepoId) -> MetadataResult<()>;

    fn insert_trash(&self, row: TrashRow) -> MetadataResult<()>;
    fn list_trash(&self) -> MetadataResult<Vec<TrashRow>>;
    /// remove and return the trash row for a repo, if present
    fn take_trash(&self, repo_id: &RepoId) -> MetadataResult<Option<TrashRow>>;
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    repos: RwLock<HashMap<RepoId, RepoRow>>,
    virtuals: RwLock<HashMap<RepoId, VirtualRepoRow>>,
    trash: RwLock<HashMap<RepoId, TrashRow>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_repo<F>(&self, id: &RepoId, f: F) -> MetadataResult<()>
    where
        F: FnOnce(&mut RepoRow),
    {
        let mut repos = self.repos.write();
        let row = repos
            .get_mut(id)
            .ok_or_else(|| MetadataError(format!("unknown repo {}", id)))?;
        f(row);
        Ok(())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn register_repo(&self, row: RepoRow) -> MetadataResult<()> {
        let mut repos = self.repos.write();
        if repos.contains_key(&row.id) {
            return Err(MetadataError(format!("repo {} already registered", row.id)));
        }
        repos.insert(row.id.clone(), row);
        Ok(())
    }

    fn get_repo(&self, id: &RepoId) -> MetadataResult<Option<RepoRow>> {
        Ok(self.repos.read().get(id).cloned())
    }

    fn list_repos(&self) -> MetadataResult<Vec<RepoRow>> {
        let mut rows: Vec<RepoRow> = self.repos.read().values().cloned().collect();
        rows.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(rows)
    }

    fn remove_repo(&self, id: &RepoId) -> MetadataResult<()> {
        self.repos.write().remove(id);
        Ok(())
    }

    fn update_status(&self, id: &RepoId, status: RepoStatus) -> MetadataResult<()> {
        self.with_repo(id, |row| row.status = status)
    }

    fn set_corrupted(&self, id: &RepoId, corrupted: bool) -> MetadataResult<()> {
        self.with_repo(id, |row| row.corrupted = corrupted)
    }

    fn set_repair_pending(&self, id: &RepoId, pending: bool) -> MetadataResult<()> {
        self.with_repo(id, |row| row.repair_pending = pending)
    }

    fn update_size_cache(&self, id: &RepoId, size: u64, file_count: u64) -> MetadataResult<()> {
        self.with_repo(id, |row| {
            row.size_cache = size;
            row.file_count_cache = file_count;
        })
    }

    fn touch_repo(&self, id: &RepoId, modifier: &str, at: DateTime<Utc>) -> MetadataResult<()> {
        self.with_repo(id, |row| {
            row.last_modify = at;
            row.last_modifier = modifier.to_string();
        })
    }

    fn insert_virtual(&self, row: VirtualRepoRow) -> MetadataResult<()> {
        self.virtuals.write().insert(row.repo_id.clone(), row);
        Ok(())
    }

    fn get_virtual(&self, repo_id: &RepoId) -> MetadataResult<Option<VirtualRepoRow>> {
        Ok(self.virtuals.read().get(repo_id).cloned())
    }

    fn list_virtual_by_origin(&self, origin: &RepoId) -> MetadataResult<Vec<VirtualRepoRow>> {
        let mut rows: Vec<VirtualRepoRow> = self
            .virtuals
            .read()
            .values()
            .filter(|row| &row.origin_repo_id == origin)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.repo_id.as_str().cmp(b.repo_id.as_str()));
        Ok(rows)
    }

    fn update_virtual_base(&self, repo_id: &RepoId, base: CommitId) -> MetadataResult<()> {
        let mut virtuals = self.virtuals.write();
        let row = virtuals
            .get_mut(repo_id)
            .ok_or_else(|| MetadataError(format!("unknown virtual repo {}", repo_id)))?;
        row.base_commit_id = base;
        Ok(())
    }

    fn remove_virtual(&self, repo_id: &RepoId) -> MetadataResult<()> {
        self.virtuals.write().remove(repo_id);
        Ok(())
    }

    fn insert_trash(&self, row: TrashRow) -> MetadataResult<()> {
        self.trash.write().insert(row.repo.id.clone(), row);
        Ok(())
    }

    fn list_trash(&self) -> MetadataResult<Vec<TrashRow>> {
        let mut rows: Vec<TrashRow> = self.trash.read().values().cloned().collect();
        rows.sort_by(|a, b| a.deleted_at.cmp(&b.deleted_at));
        Ok(rows)
    }

    fn take_trash(&self, repo_id: &RepoId) -> MetadataResult<Option<TrashRow>> {
        Ok(self.trash.write().remove(repo_id))
    }
}
