//! Commit objects and history traversal.
//!
//! A commit is an immutable node pointing at a root tree and zero, one or
//! two parents (root, linear, merge). Commits are serialized as canonical
//! JSON and content-addressed like everything else, so the commit id is the
//! hash of the serialized commit. Commits are append-only: nothing ever
//! mutates or deletes one short of whole-repository deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::ObjectStore;
use crate::storage::types::{Author, CommitId, TreeId};

/// current on-disk commit format
pub const REPO_FORMAT_VERSION: u32 = 1;

/// An immutable commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// zero for a root commit, one for linear history, two for a merge
    pub parents: Vec<CommitId>,
    pub root: TreeId,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub format_version: u32,
}

impl Commit {
    /// check if this is a merge commit (has multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// get the first (or only) parent
    pub fn first_parent(&self) -> Option<CommitId> {
        self.parents.first().copied()
    }

    /// first line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// Write a commit to the store; returns its content address.
pub fn put_commit(store: &ObjectStore, commit: &Commit) -> StorageResult<CommitId> {
    let bytes = serde_json::to_vec(commit)?;
    Ok(CommitId::new(store.put(&bytes)?.raw()))
}

/// Read a commit by id.
pub fn get_commit(store: &ObjectStore, id: CommitId) -> StorageResult<Commit> {
    let bytes = match store.get(id.as_object()) {
        Ok(bytes) => bytes,
        Err(StorageError::ObjectMissing(_)) => return Err(StorageError::CommitMissing(id)),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptObject {
        id: id.as_object(),
        reason: e.to_string(),
    })
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder {
    parents: Vec<CommitId>,
    root: Option<TreeId>,
    author: Author,
    message: String,
}

impl CommitBuilder {
    pub fn new(author: Author) -> Self {
        Self {
            parents: Vec::new(),
            root: None,
            author,
            message: String::new(),
        }
    }

    /// set the root tree for this commit
    pub fn root(mut self, root: TreeId) -> Self {
        self.root = Some(root);
        self
    }

    /// add a parent commit
    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    /// set the commit message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// build the commit and write it to the store
    pub fn write(self, store: &ObjectStore) -> StorageResult<CommitId> {
        let root = self
            .root
            .ok_or_else(|| StorageError::Internal("commit requires a root tree".to_string()))?;
        let commit = Commit {
            parents: self.parents,
            root,
            author: self.author,
            timestamp: Utc::now(),
            message: self.message,
            format_version: REPO_FORMAT_VERSION,
        };
        put_commit(store, &commit)
    }
}

/// Iterate over a commit chain following first parents.
pub struct History<'a> {
    store: &'a ObjectStore,
    next: Option<CommitId>,
}

impl<'a> History<'a> {
    pub fn new(store: &'a ObjectStore, start: CommitId) -> Self {
        Self {
            store,
            next: Some(start),
        }
    }
}

impl Iterator for History<'_> {
    type Item = StorageResult<(CommitId, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match get_commit(self.store, id) {
            Ok(commit) => {
                self.next = commit.first_parent();
                Some(Ok((id, commit)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// message formatting for repository operations
pub struct CommitMessage;

impl CommitMessage {
    pub fn init() -> String {
        "[INIT] repository created".to_string()
    }

    pub fn post_file(path: &str) -> String {
        format!("[POST] /{}", path)
    }

    pub fn put_file(path: &str) -> String {
        format!("[PUT] /{}", path)
    }

    pub fn delete(path: &str) -> String {
        format!("[DEL] /{}", path)
    }

    pub fn rename(from: &str, to: &str) -> String {
        format!("[RENAME] /{} -> /{}", from, to)
    }

    pub fn copy(path: &str) -> String {
        format!("[COPY] -> /{}", path)
    }

    pub fn mv(path: &str) -> String {
        format!("[MOVE] -> /{}", path)
    }

    pub fn mkdir(path: &str) -> String {
        format!("[MKDIR] /{}", path)
    }

    pub fn revert(path: &str, target: CommitId) -> String {
        format!("[REVERT] /{} @ {}", path, target.short())
    }

    pub fn seed_virtual(origin: &str, path: &str) -> String {
        format!("[FORK] {}:/{}", origin, path)
    }

    pub fn merge(from_repo: &str) -> String {
        format!("[MERGE] from {}", from_repo)
    }

    pub fn fast_forward(to: CommitId) -> String {
        format!("[MERGE] fast-forward to {}", to.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::empty_tree_id;
    use crate::storage::types::RepoId;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::create(RepoId::generate(), dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_commit_roundtrip() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();

        let id = CommitBuilder::new(Author::new("alice", "alice@example.com"))
            .root(root)
            .message("first")
            .write(&store)
            .unwrap();

        let commit = get_commit(&store, id).unwrap();
        assert_eq!(commit.root, root);
        assert!(commit.parents.is_empty());
        assert!(!commit.is_merge());
        assert_eq!(commit.summary(), "first");
        assert_eq!(commit.format_version, REPO_FORMAT_VERSION);
    }

    #[test]
    fn test_missing_commit() {
        let (_dir, store) = setup();
        let absent = CommitId::from_hex("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();

        let result = get_commit(&store, absent);
        assert!(matches!(result, Err(StorageError::CommitMissing(_))));
    }

    #[test]
    fn test_history_walks_first_parents() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let author = Author::system();

        let c1 = CommitBuilder::new(author.clone())
            .root(root)
            .message("one")
            .write(&store)
            .unwrap();
        let c2 = CommitBuilder::new(author.clone())
            .root(root)
            .parent(c1)
            .message("two")
            .write(&store)
            .unwrap();
        let c3 = CommitBuilder::new(author)
            .root(root)
            .parent(c2)
            .message("three")
            .write(&store)
            .unwrap();

        let chain: Vec<_> = History::new(&store, c3)
            .collect::<StorageResult<Vec<_>>>()
            .unwrap();
        let ids: Vec<CommitId> = chain.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![c3, c2, c1]);
    }

    #[test]
    fn test_merge_commit_shape() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let author = Author::system();

        let a = CommitBuilder::new(author.clone())
            .root(root)
            .message("a")
            .write(&store)
            .unwrap();
        let b = CommitBuilder::new(author.clone())
            .root(root)
            .message("b")
            .write(&store)
            .unwrap();

        let m = CommitBuilder::new(author)
            .root(root)
            .parent(a)
            .parent(b)
            .message("merge")
            .write(&store)
            .unwrap();

        let commit = get_commit(&store, m).unwrap();
        assert!(commit.is_merge());
        assert_eq!(commit.first_parent(), Some(a));
    }
}
