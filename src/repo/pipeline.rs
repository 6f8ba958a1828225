//! The mutation pipeline.
//!
//! Every write to a repository goes through [`commit_mutation`]: load the
//! head commit, apply one [`FileOp`] to its root tree (writing new trees,
//! never touching old ones), write a commit, then compare-and-swap the
//! branch head. If the swap loses to a concurrent committer the operation
//! is re-applied against the new head, up to [`MAX_COMMIT_ATTEMPTS`] times.
//! A caller that pinned an expected head gets no retry — a lost swap is
//! reported as [`RepoError::ConcurrentModification`] immediately.

use crate::repo::error::{RepoError, RepoResult};
use crate::storage::commit::{get_commit, CommitBuilder, CommitMessage};
use crate::storage::store::ObjectStore;
use crate::storage::tree::{self, Dirent, DEFAULT_FILE_MODE};
use crate::storage::types::{Author, CommitId, FileId, FileName, RepoId, RepoPath, TreeId};
use crate::storage::{refs, StorageError};

/// Retry budget for unpinned mutations that lose the head race.
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// One atomic change to a repository's tree.
#[derive(Debug, Clone)]
pub enum FileOp {
    /// add a new file under a directory
    PostFile {
        dir: RepoPath,
        name: FileName,
        file: FileId,
        size: u64,
        replace_existing: bool,
    },
    /// update the content of an existing file
    PutFile {
        path: RepoPath,
        file: FileId,
        size: u64,
        /// when set, the file's current id must still match or the update
        /// is rejected as a concurrent modification
        expected_file_id: Option<FileId>,
    },
    /// remove a file or directory (recursively, by dropping the entry)
    Delete { path: RepoPath },
    /// rename an entry within its directory
    Rename {
        dir: RepoPath,
        from: FileName,
        to: FileName,
    },
    /// graft an already-stored entry under a directory; with `remove_source`
    /// set this is a same-repository move in one commit
    CopyIn {
        dir: RepoPath,
        name: FileName,
        entry: Dirent,
        replace_existing: bool,
        remove_source: Option<RepoPath>,
    },
    /// create an empty directory
    Mkdir { dir: RepoPath, name: FileName },
    /// create a directory and any missing ancestors
    MkdirWithParents { path: RepoPath },
    /// restore a path to its state at a historical commit
    Revert {
        path: RepoPath,
        /// what the path held at the target commit; None deletes it
        entry: Option<Dirent>,
        target: CommitId,
    },
    /// swap out an entire subtree (merge plumbing)
    ReplaceSubtree {
        path: RepoPath,
        entry: Dirent,
        from_repo: RepoId,
    },
}

impl FileOp {
    /// commit message for this operation
    pub fn describe(&self) -> String {
        match self {
            FileOp::PostFile { dir, name, .. } => {
                CommitMessage::post_file(dir.join(name).as_str())
            }
            FileOp::PutFile { path, .. } => CommitMessage::put_file(path.as_str()),
            FileOp::Delete { path } => CommitMessage::delete(path.as_str()),
            FileOp::Rename { dir, from, to } => {
                CommitMessage::rename(dir.join(from).as_str(), dir.join(to).as_str())
            }
            FileOp::CopyIn {
                dir,
                name,
                remove_source,
                ..
            } => {
                let dest = dir.join(name);
                if remove_source.is_some() {
                    CommitMessage::mv(dest.as_str())
                } else {
                    CommitMessage::copy(dest.as_str())
                }
            }
            FileOp::Mkdir { dir, name } => CommitMessage::mkdir(dir.join(name).as_str()),
            FileOp::MkdirWithParents { path } => CommitMessage::mkdir(path.as_str()),
            FileOp::Revert { path, target, .. } => CommitMessage::revert(path.as_str(), *target),
            FileOp::ReplaceSubtree { from_repo, .. } => {
                CommitMessage::merge(from_repo.as_str())
            }
        }
    }

    /// Apply this operation to `root`, returning the new root tree.
    ///
    /// Pure with respect to the branch head: only tree objects are written.
    /// Returning the unchanged root means the operation was a no-op.
    fn apply(&self, store: &ObjectStore, repo: &RepoId, root: TreeId) -> RepoResult<TreeId> {
        let wrap = |e| RepoError::from_storage(repo, "apply mutation", e);
        match self {
            FileOp::PostFile {
                dir,
                name,
                file,
                size,
                replace_existing,
            } => {
                let full = dir.join(name);
                // replace_existing permits file-over-file only
                match tree::resolve(store, root, &full).map_err(wrap)? {
                    None => {}
                    Some(Dirent::File { .. }) if *replace_existing => {}
                    Some(Dirent::Dir { .. }) if *replace_existing => {
                        return Err(RepoError::InvalidOperation(format!(
                            "{} is a directory",
                            full
                        )));
                    }
                    Some(_) => {
                        return Err(wrap(StorageError::EntryExists(
                            full.as_str().to_string(),
                        )));
                    }
                }
                let entry = Dirent::File {
                    id: *file,
                    size: *size,
                    mode: DEFAULT_FILE_MODE,
                };
                tree::replace(store, root, &full, Some(entry), false).map_err(wrap)
            }
            FileOp::PutFile {
                path,
                file,
                size,
                expected_file_id,
            } => {
                let existing = tree::resolve(store, root, path).map_err(wrap)?;
                let mode = match existing {
                    Some(Dirent::File { id, mode, .. }) => {
                        if let Some(expected) = expected_file_id {
                            if id != *expected {
                                return Err(RepoError::ConcurrentModification {
                                    repo: repo.clone(),
                                });
                            }
                        }
                        mode
                    }
                    Some(Dirent::Dir { .. }) => {
                        return Err(RepoError::InvalidOperation(format!(
                            "{} is a directory",
                            path
                        )));
                    }
                    None => {
                        return Err(wrap(StorageError::EntryNotFound(
                            path.as_str().to_string(),
                        )));
                    }
                };
                let entry = Dirent::File {
                    id: *file,
                    size: *size,
                    mode,
                };
                tree::replace(store, root, path, Some(entry), false).map_err(wrap)
            }
            FileOp::Delete { path } => {
                tree::replace(store, root, path, None, false).map_err(wrap)
            }
            FileOp::Rename { dir, from, to } => {
                let source = dir.join(from);
                let dest = dir.join(to);
                let entry = tree::resolve(store, root, &source)
                    .map_err(wrap)?
                    .ok_or_else(|| {
                        wrap(StorageError::EntryNotFound(source.as_str().to_string()))
                    })?;
                if tree::resolve(store, root, &dest).map_err(wrap)?.is_some() {
                    return Err(wrap(StorageError::EntryExists(dest.as_str().to_string())));
                }
                let root = tree::replace(store, root, &dest, Some(entry), false).map_err(wrap)?;
                tree::replace(store, root, &source, None, false).map_err(wrap)
            }
            FileOp::CopyIn {
                dir,
                name,
                entry,
                replace_existing,
                remove_source,
            } => {
                let dest = dir.join(name);
                match tree::resolve(store, root, &dest).map_err(wrap)? {
                    None => {}
                    Some(Dirent::File { .. }) if *replace_existing => {}
                    Some(Dirent::Dir { .. }) if *replace_existing => {
                        return Err(RepoError::InvalidOperation(format!(
                            "{} is a directory",
                            dest
                        )));
                    }
                    Some(_) => {
                        return Err(wrap(StorageError::EntryExists(
                            dest.as_str().to_string(),
                        )));
                    }
                }
                let root =
                    tree::replace(store, root, &dest, Some(*entry), false).map_err(wrap)?;
                match remove_source {
                    Some(source) => {
                        tree::replace(store, root, source, None, false).map_err(wrap)
                    }
                    None => Ok(root),
                }
            }
            FileOp::Mkdir { dir, name } => {
                let full = dir.join(name);
                if tree::resolve(store, root, &full).map_err(wrap)?.is_some() {
                    return Err(wrap(StorageError::EntryExists(full.as_str().to_string())));
                }
                let empty = tree::empty_tree_id(store).map_err(wrap)?;
                tree::replace(store, root, &full, Some(Dirent::Dir { id: empty }), false)
                    .map_err(wrap)
            }
            FileOp::MkdirWithParents { path } => {
                match tree::resolve(store, root, path).map_err(wrap)? {
                    // already there, nothing to do
                    Some(Dirent::Dir { .. }) => Ok(root),
                    Some(Dirent::File { .. }) => {
                        Err(wrap(StorageError::EntryExists(path.as_str().to_string())))
                    }
                    None => {
                        let empty = tree::empty_tree_id(store).map_err(wrap)?;
                        tree::replace(store, root, path, Some(Dirent::Dir { id: empty }), true)
                            .map_err(wrap)
                    }
                }
            }
            FileOp::Revert { path, entry, .. } => match entry {
                Some(e) => {
                    tree::replace(store, root, path, Some(*e), true).map_err(wrap)
                }
                None => {
                    if tree::resolve(store, root, path).map_err(wrap)?.is_none() {
                        return Ok(root);
                    }
                    tree::replace(store, root, path, None, false).map_err(wrap)
                }
            },
            FileOp::ReplaceSubtree { path, entry, .. } => {
                if path.is_root() {
                    return match entry {
                        Dirent::Dir { id } => Ok(*id),
                        Dirent::File { .. } => Err(RepoError::InvalidOperation(
                            "cannot replace the root with a file".to_string(),
                        )),
                    };
                }
                tree::replace(store, root, path, Some(*entry), true).map_err(wrap)
            }
        }
    }
}

/// Run one mutation against a repository's branch.
///
/// With `expected_head = Some(h)` the commit only lands if the head is still
/// `h` — no retries. With `None` the current head is used and the operation
/// retries against fresh heads when the swap is lost.
///
/// Returns the new head commit. A no-op (the tree did not change) returns
/// the existing head without writing a commit.
pub fn commit_mutation(
    store: &ObjectStore,
    repo_id: &RepoId,
    expected_head: Option<CommitId>,
    op: &FileOp,
    author: &Author,
) -> RepoResult<CommitId> {
    let wrap = |e| RepoError::from_storage(repo_id, "commit mutation", e);
    let pinned = expected_head.is_some();
    let mut head = match expected_head {
        Some(h) => h,
        None => refs::get_head(store, repo_id).map_err(wrap)?,
    };

    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        let parent = get_commit(store, head).map_err(wrap)?;
        let new_root = op.apply(store, repo_id, parent.root)?;
        if new_root == parent.root {
            return Ok(head);
        }

        let commit = CommitBuilder::new(author.clone())
            .root(new_root)
            .parent(head)
            .message(op.describe())
            .write(store)
            .map_err(wrap)?;

        if refs::cas_head(store, repo_id, head, commit).map_err(wrap)? {
            return Ok(commit);
        }
        if pinned || attempt == MAX_COMMIT_ATTEMPTS {
            break;
        }
        tracing::debug!(repo = %repo_id, attempt, "head moved, retrying mutation");
        head = refs::get_head(store, repo_id).map_err(wrap)?;
    }

    Err(RepoError::ConcurrentModification {
        repo: repo_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::empty_tree_id;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectStore, RepoId) {
        let dir = TempDir::new().unwrap();
        let repo_id = RepoId::generate();
        let store = ObjectStore::create(repo_id.clone(), dir.path().join("store")).unwrap();
        let root = empty_tree_id(&store).unwrap();
        let init = CommitBuilder::new(Author::system())
            .root(root)
            .message(CommitMessage::init())
            .write(&store)
            .unwrap();
        refs::init_branch(&store, &repo_id, init).unwrap();
        (dir, store, repo_id)
    }

    fn put_blob(store: &ObjectStore, content: &[u8]) -> (FileId, u64) {
        let id = FileId::new(store.put(content).unwrap().raw());
        (id, content.len() as u64)
    }

    fn post(store: &ObjectStore, repo: &RepoId, path: &str, content: &[u8]) -> CommitId {
        let path = RepoPath::new(path).unwrap();
        let (dir, name) = path.split_last().unwrap();
        if !dir.is_root() {
            let op = FileOp::MkdirWithParents { path: dir.clone() };
            commit_mutation(store, repo, None, &op, &Author::system()).unwrap();
        }
        let (file, size) = put_blob(store, content);
        let op = FileOp::PostFile {
            dir,
            name: FileName::new(name).unwrap(),
            file,
            size,
            replace_existing: false,
        };
        commit_mutation(store, repo, None, &op, &Author::system()).unwrap()
    }

    fn head_root(store: &ObjectStore, repo: &RepoId) -> TreeId {
        let head = refs::get_head(store, repo).unwrap();
        get_commit(store, head).unwrap().root
    }

    #[test]
    fn test_post_creates_commit_with_file() {
        let (_dir, store, repo) = setup();
        let before = refs::get_head(&store, &repo).unwrap();

        let head = post(&store, &repo, "notes.txt", b"hello");
        assert_ne!(head, before);
        assert_eq!(refs::get_head(&store, &repo).unwrap(), head);

        let commit = get_commit(&store, head).unwrap();
        assert_eq!(commit.parents, vec![before]);
        assert_eq!(commit.summary(), "[POST] /notes.txt");

        let entry = tree::resolve(&store, commit.root, &RepoPath::new("notes.txt").unwrap())
            .unwrap()
            .unwrap();
        assert!(entry.is_file());
        assert_eq!(
            store.get(entry.file_id().unwrap().as_object()).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_post_duplicate_rejected_unless_replacing() {
        let (_dir, store, repo) = setup();
        post(&store, &repo, "a.txt", b"one");

        let (file, size) = put_blob(&store, b"two");
        let op = FileOp::PostFile {
            dir: RepoPath::root(),
            name: FileName::new("a.txt").unwrap(),
            file,
            size,
            replace_existing: false,
        };
        let result = commit_mutation(&store, &repo, None, &op, &Author::system());
        assert!(matches!(result, Err(RepoError::InvalidOperation(_))));

        let op = FileOp::PostFile {
            dir: RepoPath::root(),
            name: FileName::new("a.txt").unwrap(),
            file,
            size,
            replace_existing: true,
        };
        commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();
    }

    #[test]
    fn test_replace_existing_refuses_directory_targets() {
        let (_dir, store, repo) = setup();
        post(&store, &repo, "docs/keep.txt", b"k");
        post(&store, &repo, "loose.txt", b"l");
        let before = refs::get_head(&store, &repo).unwrap();

        let (file, size) = put_blob(&store, b"i am a file");
        let op = FileOp::PostFile {
            dir: RepoPath::root(),
            name: FileName::new("docs").unwrap(),
            file,
            size,
            replace_existing: true,
        };
        let result = commit_mutation(&store, &repo, None, &op, &Author::system());
        assert!(matches!(result, Err(RepoError::InvalidOperation(_))));

        let entry = tree::resolve(
            &store,
            head_root(&store, &repo),
            &RepoPath::new("loose.txt").unwrap(),
        )
        .unwrap()
        .unwrap();
        let op = FileOp::CopyIn {
            dir: RepoPath::root(),
            name: FileName::new("docs").unwrap(),
            entry,
            replace_existing: true,
            remove_source: None,
        };
        let result = commit_mutation(&store, &repo, None, &op, &Author::system());
        assert!(matches!(result, Err(RepoError::InvalidOperation(_))));

        // nothing committed, the subtree is intact
        assert_eq!(refs::get_head(&store, &repo).unwrap(), before);
        let root = head_root(&store, &repo);
        assert!(
            tree::resolve(&store, root, &RepoPath::new("docs/keep.txt").unwrap())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_put_checks_expected_file_id() {
        let (_dir, store, repo) = setup();
        post(&store, &repo, "a.txt", b"v1");
        let path = RepoPath::new("a.txt").unwrap();
        let v1_id = tree::resolve(&store, head_root(&store, &repo), &path)
            .unwrap()
            .unwrap()
            .file_id()
            .unwrap();

        // honest update against the current file id
        let (v2, size) = put_blob(&store, b"v2");
        let op = FileOp::PutFile {
            path: path.clone(),
            file: v2,
            size,
            expected_file_id: Some(v1_id),
        };
        commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();

        // stale update still expecting v1
        let (v3, size) = put_blob(&store, b"v3");
        let op = FileOp::PutFile {
            path,
            file: v3,
            size,
            expected_file_id: Some(v1_id),
        };
        let result = commit_mutation(&store, &repo, None, &op, &Author::system());
        assert!(matches!(
            result,
            Err(RepoError::ConcurrentModification { .. })
        ));
    }

    #[test]
    fn test_put_missing_file() {
        let (_dir, store, repo) = setup();
        let (file, size) = put_blob(&store, b"x");
        let op = FileOp::PutFile {
            path: RepoPath::new("absent.txt").unwrap(),
            file,
            size,
            expected_file_id: None,
        };
        let result = commit_mutation(&store, &repo, None, &op, &Author::system());
        assert!(matches!(result, Err(RepoError::NotFound(_))));
    }

    #[test]
    fn test_delete_and_rename() {
        let (_dir, store, repo) = setup();
        post(&store, &repo, "docs/a.txt", b"a");

        let op = FileOp::Rename {
            dir: RepoPath::new("docs").unwrap(),
            from: FileName::new("a.txt").unwrap(),
            to: FileName::new("b.txt").unwrap(),
        };
        commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();

        let root = head_root(&store, &repo);
        assert!(tree::resolve(&store, root, &RepoPath::new("docs/a.txt").unwrap())
            .unwrap()
            .is_none());
        assert!(tree::resolve(&store, root, &RepoPath::new("docs/b.txt").unwrap())
            .unwrap()
            .is_some());

        let op = FileOp::Delete {
            path: RepoPath::new("docs").unwrap(),
        };
        commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();
        let root = head_root(&store, &repo);
        assert!(tree::resolve(&store, root, &RepoPath::new("docs").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mkdir_with_parents_is_idempotent() {
        let (_dir, store, repo) = setup();
        let op = FileOp::MkdirWithParents {
            path: RepoPath::new("a/b/c").unwrap(),
        };
        let h1 = commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();
        // second application changes nothing and writes no commit
        let h2 = commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(refs::get_head(&store, &repo).unwrap(), h1);
    }

    #[test]
    fn test_pinned_head_does_not_retry() {
        let (_dir, store, repo) = setup();
        let old_head = refs::get_head(&store, &repo).unwrap();
        post(&store, &repo, "mover.txt", b"moved the head");

        let (file, size) = put_blob(&store, b"pinned");
        let op = FileOp::PostFile {
            dir: RepoPath::root(),
            name: FileName::new("pinned.txt").unwrap(),
            file,
            size,
            replace_existing: false,
        };
        let result = commit_mutation(&store, &repo, Some(old_head), &op, &Author::system());
        assert!(matches!(
            result,
            Err(RepoError::ConcurrentModification { .. })
        ));
        // the failed attempt left the head alone
        let root = head_root(&store, &repo);
        assert!(tree::resolve(&store, root, &RepoPath::new("pinned.txt").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_move_in_one_commit() {
        let (_dir, store, repo) = setup();
        post(&store, &repo, "src/f.txt", b"payload");
        commit_mutation(
            &store,
            &repo,
            None,
            &FileOp::MkdirWithParents {
                path: RepoPath::new("dst").unwrap(),
            },
            &Author::system(),
        )
        .unwrap();
        let before = refs::get_head(&store, &repo).unwrap();

        let entry = tree::resolve(
            &store,
            head_root(&store, &repo),
            &RepoPath::new("src/f.txt").unwrap(),
        )
        .unwrap()
        .unwrap();
        let op = FileOp::CopyIn {
            dir: RepoPath::new("dst").unwrap(),
            name: FileName::new("f.txt").unwrap(),
            entry,
            replace_existing: false,
            remove_source: Some(RepoPath::new("src/f.txt").unwrap()),
        };
        let head = commit_mutation(&store, &repo, None, &op, &Author::system()).unwrap();

        let commit = get_commit(&store, head).unwrap();
        assert_eq!(commit.parents, vec![before]);
        let root = commit.root;
        assert!(tree::resolve(&store, root, &RepoPath::new("src/f.txt").unwrap())
            .unwrap()
            .is_none());
        assert!(tree::resolve(&store, root, &RepoPath::new("dst/f.txt").unwrap())
            .unwrap()
            .is_some());
    }
}
