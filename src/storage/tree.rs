//! Directory trees and the path resolver.
//!
//! A tree is an ordered set of named entries, each a subtree or a file.
//! Trees are immutable and content-addressed: serialized as canonical JSON
//! (BTreeMap keys, so ordering is deterministic — important for
//! deduplication) and written to the object store, so two directories with
//! identical contents share one id.
//!
//! "Mutation" is purely functional: [`replace`] walks down to the terminal
//! segment's parent, swaps the named entry, then rebuilds every ancestor
//! bottom-up into new tree objects. Old objects are left unreferenced for
//! external garbage collection; nothing is ever rewritten in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::ObjectStore;
use crate::storage::types::{FileId, RepoPath, TreeId};

/// default mode for regular files
pub const DEFAULT_FILE_MODE: u32 = 0o100644;

/// One directory entry: a subtree or a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Dirent {
    Dir { id: TreeId },
    File { id: FileId, size: u64, mode: u32 },
}

impl Dirent {
    pub fn is_dir(&self) -> bool {
        matches!(self, Dirent::Dir { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Dirent::File { .. })
    }

    /// subtree id, if this is a directory
    pub fn tree_id(&self) -> Option<TreeId> {
        match self {
            Dirent::Dir { id } => Some(*id),
            Dirent::File { .. } => None,
        }
    }

    /// file content id, if this is a file
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Dirent::File { id, .. } => Some(*id),
            Dirent::Dir { .. } => None,
        }
    }
}

/// An in-memory directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: BTreeMap<String, Dirent>,
}

impl Tree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a tree object from the store.
    pub fn load(store: &ObjectStore, id: TreeId) -> StorageResult<Self> {
        let bytes = store.get(id.as_object())?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptObject {
            id: id.as_object(),
            reason: e.to_string(),
        })
    }

    /// Write this tree to the store; returns its content address.
    pub fn save(&self, store: &ObjectStore) -> StorageResult<TreeId> {
        let bytes = serde_json::to_vec(self)?;
        Ok(TreeId::new(store.put(&bytes)?.raw()))
    }

    pub fn get(&self, name: &str) -> Option<&Dirent> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: String, entry: Dirent) -> Option<Dirent> {
        self.entries.insert(name, entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<Dirent> {
        self.entries.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dirent)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Write an empty tree and return its id (the root of every new repository).
pub fn empty_tree_id(store: &ObjectStore) -> StorageResult<TreeId> {
    Tree::empty().save(store)
}

/// Resolve a path against a root tree.
///
/// Returns the entry at `path`, or None if any segment is absent. A file in
/// an intermediate position also resolves to None — a file cannot contain
/// entries. The root path resolves to the root tree itself.
pub fn resolve(store: &ObjectStore, root: TreeId, path: &RepoPath) -> StorageResult<Option<Dirent>> {
    let mut current = Dirent::Dir { id: root };
    for seg in path.components() {
        let tree_id = match current.tree_id() {
            Some(id) => id,
            None => return Ok(None),
        };
        let tree = Tree::load(store, tree_id)?;
        match tree.get(seg) {
            Some(entry) => current = *entry,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Replace the entry at `path`, rebuilding ancestors bottom-up.
///
/// `entry = Some(..)` inserts or overwrites the named entry; `entry = None`
/// removes it (failing `EntryNotFound` if absent). Missing intermediate
/// directories fail `PathNotFound`, unless `create_parents` is set and the
/// operation is an insert, in which case empty directories are synthesized
/// along the way (mkdir -p semantics). A file in an intermediate position
/// fails `NotADirectory`.
///
/// Returns the new root tree id. Existing tree objects are never mutated.
pub fn replace(
    store: &ObjectStore,
    root: TreeId,
    path: &RepoPath,
    entry: Option<Dirent>,
    create_parents: bool,
) -> StorageResult<TreeId> {
    if path.is_root() {
        return Err(StorageError::Internal(
            "cannot replace the root entry".to_string(),
        ));
    }
    let segments: Vec<&str> = path.components().collect();
    replace_in(store, root, &segments, entry, create_parents, path)
}

fn replace_in(
    store: &ObjectStore,
    tree_id: TreeId,
    segments: &[&str],
    entry: Option<Dirent>,
    create_parents: bool,
    full_path: &RepoPath,
) -> StorageResult<TreeId> {
    let mut tree = Tree::load(store, tree_id)?;
    let (seg, rest) = segments
        .split_first()
        .ok_or_else(|| StorageError::Internal("empty path segments".to_string()))?;

    if rest.is_empty() {
        match entry {
            Some(e) => {
                tree.insert(seg.to_string(), e);
            }
            None => {
                if tree.remove(seg).is_none() {
                    return Err(StorageError::EntryNotFound(full_path.as_str().to_string()));
                }
            }
        }
    } else {
        let child_id = match tree.get(seg) {
            Some(Dirent::Dir { id }) => *id,
            Some(Dirent::File { .. }) => {
                return Err(StorageError::NotADirectory(full_path.as_str().to_string()));
            }
            None if create_parents && entry.is_some() => empty_tree_id(store)?,
            None => {
                return Err(StorageError::PathNotFound(full_path.as_str().to_string()));
            }
        };
        let new_child = replace_in(store, child_id, rest, entry, create_parents, full_path)?;
        tree.insert(seg.to_string(), Dirent::Dir { id: new_child });
    }

    tree.save(store)
}

/// a change between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    /// slash-separated path relative to the diffed roots
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

/// Recursive diff between two trees.
///
/// Added/deleted entries are reported once at the highest level where they
/// appear; directories changed on both sides are descended into. An entry
/// that flips between file and directory is reported as Modified.
pub fn diff(store: &ObjectStore, old: TreeId, new: TreeId) -> StorageResult<Vec<TreeChange>> {
    let mut changes = Vec::new();
    diff_in(store, old, new, "", &mut changes)?;
    Ok(changes)
}

fn diff_in(
    store: &ObjectStore,
    old: TreeId,
    new: TreeId,
    prefix: &str,
    changes: &mut Vec<TreeChange>,
) -> StorageResult<()> {
    if old == new {
        return Ok(());
    }
    let old_tree = Tree::load(store, old)?;
    let new_tree = Tree::load(store, new)?;

    let mut names: Vec<&str> = old_tree.iter().map(|(n, _)| n).collect();
    names.extend(new_tree.iter().map(|(n, _)| n));
    names.sort_unstable();
    names.dedup();

    for name in names {
        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };
        match (old_tree.get(name), new_tree.get(name)) {
            (None, Some(_)) => changes.push(TreeChange {
                path: rel,
                kind: ChangeKind::Added,
            }),
            (Some(_), None) => changes.push(TreeChange {
                path: rel,
                kind: ChangeKind::Deleted,
            }),
            (Some(a), Some(b)) if a == b => {}
            (Some(Dirent::Dir { id: a }), Some(Dirent::Dir { id: b })) => {
                diff_in(store, *a, *b, &rel, changes)?;
            }
            (Some(_), Some(_)) => changes.push(TreeChange {
                path: rel,
                kind: ChangeKind::Modified,
            }),
            (None, None) => unreachable!(),
        }
    }
    Ok(())
}

/// Deep-copy an object graph into another store.
///
/// Content addressing means ids are preserved: copying never changes an id,
/// it only makes the objects resolvable in the destination. Used by
/// cross-repository copy/move.
pub fn copy_between(src: &ObjectStore, dst: &ObjectStore, entry: &Dirent) -> StorageResult<()> {
    match entry {
        Dirent::File { id, .. } => {
            if !dst.exists(id.as_object())? {
                let bytes = src.get(id.as_object())?;
                dst.put(&bytes)?;
            }
            Ok(())
        }
        Dirent::Dir { id } => {
            if dst.exists(id.as_object())? {
                return Ok(());
            }
            let tree = Tree::load(src, *id)?;
            for (_, child) in tree.iter() {
                copy_between(src, dst, child)?;
            }
            let bytes = src.get(id.as_object())?;
            dst.put(&bytes)?;
            Ok(())
        }
    }
}

/// Recursive size accounting for a tree: (total file bytes, file count).
pub fn size_of(store: &ObjectStore, root: TreeId) -> StorageResult<(u64, u64)> {
    let tree = Tree::load(store, root)?;
    let mut bytes = 0u64;
    let mut files = 0u64;
    for (_, entry) in tree.iter() {
        match entry {
            Dirent::File { size, .. } => {
                bytes += size;
                files += 1;
            }
            Dirent::Dir { id } => {
                let (b, f) = size_of(store, *id)?;
                bytes += b;
                files += f;
            }
        }
    }
    Ok((bytes, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::RepoId;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::create(RepoId::generate(), dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn file_entry(store: &ObjectStore, content: &[u8]) -> Dirent {
        let id = store.put(content).unwrap();
        Dirent::File {
            id: FileId::new(id.raw()),
            size: content.len() as u64,
            mode: DEFAULT_FILE_MODE,
        }
    }

    fn path(s: &str) -> RepoPath {
        RepoPath::new(s).unwrap()
    }

    #[test]
    fn test_identical_trees_share_an_id() {
        let (_dir, store) = setup();
        let file = file_entry(&store, b"contents");

        let mut a = Tree::empty();
        a.insert("x.txt".to_string(), file);
        let mut b = Tree::empty();
        b.insert("x.txt".to_string(), file);

        assert_eq!(a.save(&store).unwrap(), b.save(&store).unwrap());
    }

    #[test]
    fn test_resolve_replace_roundtrip() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"hello");

        let root = replace(&store, root, &path("a/b/c.txt"), Some(file), true).unwrap();

        let got = resolve(&store, root, &path("a/b/c.txt")).unwrap();
        assert_eq!(got, Some(file));

        // intermediate directories were synthesized
        assert!(resolve(&store, root, &path("a/b")).unwrap().unwrap().is_dir());
        assert!(resolve(&store, root, &path("a")).unwrap().unwrap().is_dir());
    }

    #[test]
    fn test_resolve_root_and_missing() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();

        let got = resolve(&store, root, &RepoPath::root()).unwrap();
        assert_eq!(got, Some(Dirent::Dir { id: root }));

        assert_eq!(resolve(&store, root, &path("nope")).unwrap(), None);
    }

    #[test]
    fn test_resolve_through_file_is_none() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"x");
        let root = replace(&store, root, &path("f.txt"), Some(file), false).unwrap();

        assert_eq!(resolve(&store, root, &path("f.txt/child")).unwrap(), None);
    }

    #[test]
    fn test_replace_missing_parent_fails() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"x");

        let result = replace(&store, root, &path("a/b.txt"), Some(file), false);
        assert!(matches!(result, Err(StorageError::PathNotFound(_))));
    }

    #[test]
    fn test_replace_through_file_fails() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"x");
        let root = replace(&store, root, &path("f"), Some(file), false).unwrap();

        let result = replace(&store, root, &path("f/inner.txt"), Some(file), true);
        assert!(matches!(result, Err(StorageError::NotADirectory(_))));
    }

    #[test]
    fn test_remove_entry() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"x");
        let root = replace(&store, root, &path("dir/f.txt"), Some(file), true).unwrap();

        let root = replace(&store, root, &path("dir/f.txt"), None, false).unwrap();
        assert_eq!(resolve(&store, root, &path("dir/f.txt")).unwrap(), None);
        // the now-empty directory stays
        assert!(resolve(&store, root, &path("dir")).unwrap().unwrap().is_dir());

        let result = replace(&store, root, &path("dir/f.txt"), None, false);
        assert!(matches!(result, Err(StorageError::EntryNotFound(_))));
    }

    #[test]
    fn test_replace_leaves_old_root_intact() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let file = file_entry(&store, b"v1");
        let root1 = replace(&store, root, &path("f.txt"), Some(file), false).unwrap();

        let file2 = file_entry(&store, b"v2");
        let root2 = replace(&store, root1, &path("f.txt"), Some(file2), false).unwrap();

        assert_ne!(root1, root2);
        assert_eq!(resolve(&store, root1, &path("f.txt")).unwrap(), Some(file));
        assert_eq!(resolve(&store, root2, &path("f.txt")).unwrap(), Some(file2));
    }

    #[test]
    fn test_diff_trees() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let a = file_entry(&store, b"a");
        let b = file_entry(&store, b"b");

        let old = replace(&store, root, &path("docs/kept.txt"), Some(a), true).unwrap();
        let old = replace(&store, old, &path("docs/gone.txt"), Some(a), false).unwrap();

        let new = replace(&store, old, &path("docs/gone.txt"), None, false).unwrap();
        let new = replace(&store, new, &path("docs/kept.txt"), Some(b), false).unwrap();
        let new = replace(&store, new, &path("added.txt"), Some(a), false).unwrap();

        let mut changes = diff(&store, old, new).unwrap();
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            changes,
            vec![
                TreeChange {
                    path: "added.txt".to_string(),
                    kind: ChangeKind::Added
                },
                TreeChange {
                    path: "docs/gone.txt".to_string(),
                    kind: ChangeKind::Deleted
                },
                TreeChange {
                    path: "docs/kept.txt".to_string(),
                    kind: ChangeKind::Modified
                },
            ]
        );
    }

    #[test]
    fn test_copy_between_stores_preserves_ids() {
        let dir = TempDir::new().unwrap();
        let src = ObjectStore::create(RepoId::generate(), dir.path().join("src")).unwrap();
        let dst = ObjectStore::create(RepoId::generate(), dir.path().join("dst")).unwrap();

        let root = empty_tree_id(&src).unwrap();
        let file = file_entry(&src, b"payload");
        let root = replace(&src, root, &path("a/b.txt"), Some(file), true).unwrap();
        let subtree = resolve(&src, root, &path("a")).unwrap().unwrap();

        copy_between(&src, &dst, &subtree).unwrap();

        // same ids resolve in the destination store now
        let copied = resolve(&dst, subtree.tree_id().unwrap(), &path("b.txt")).unwrap();
        assert_eq!(copied, Some(file));
        assert_eq!(dst.get(file.file_id().unwrap().as_object()).unwrap(), b"payload");
    }

    #[test]
    fn test_size_accounting() {
        let (_dir, store) = setup();
        let root = empty_tree_id(&store).unwrap();
        let root = replace(&store, root, &path("a.bin"), Some(file_entry(&store, &[0u8; 10])), false).unwrap();
        let root = replace(&store, root, &path("d/b.bin"), Some(file_entry(&store, &[0u8; 32])), true).unwrap();

        let (bytes, files) = size_of(&store, root).unwrap();
        assert_eq!(bytes, 42);
        assert_eq!(files, 2);
    }
}
