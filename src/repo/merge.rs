//! Synchronization between virtual repositories and their origins.
//!
//! Each virtual repository tracks a merge base: the last origin commit whose
//! shared subtree both sides agree on. Syncing compares three trees — the
//! subtree at the base, the subtree at the origin's head ("theirs") and the
//! virtual repository's root ("ours") — and reconciles entry by entry. A
//! side that didn't change takes the other side's version wholesale; when
//! both changed the same entry incompatibly the merge stops with a conflict
//! and neither head moves.

use crate::repo::engine::RepoEngine;
use crate::repo::error::{RepoError, RepoResult};
use crate::repo::pipeline::FileOp;
use crate::metadata::VirtualRepoRow;
use crate::storage::commit::{CommitBuilder, CommitMessage};
use crate::storage::error::StorageResult;
use crate::storage::tree::{self, Dirent, Tree};
use crate::storage::types::{Author, CommitId, RepoId, RepoPath, TreeId};
use crate::storage::{refs, ObjectStore};

/// What one virtual/origin sync did.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// nothing changed on either side
    UpToDate { repo: RepoId },
    /// only the origin had changed; the virtual head advanced to match
    FastForwarded { repo: RepoId, commit: CommitId },
    /// changes flowed between the sides; `commit` is the new head of `repo`
    Merged { repo: RepoId, commit: CommitId },
}

impl RepoEngine {
    /// Synchronize virtual repositories with their origin.
    ///
    /// Called with a virtual repository, syncs that one. Called with an
    /// origin, syncs every virtual repository carved out of it, skipping
    /// `exclude` (typically the one whose own mutation triggered the sync).
    ///
    /// A conflict aborts with [`RepoError::Conflict`] and leaves both heads
    /// and the merge base untouched.
    pub fn merge_virtual(
        &self,
        repo: &RepoId,
        exclude: Option<&RepoId>,
    ) -> RepoResult<Vec<MergeOutcome>> {
        let mut outcomes = Vec::new();
        if let Some(row) = self.inner.metadata.get_virtual(repo)? {
            outcomes.push(self.merge_pair(&row)?);
        } else {
            self.repo_info(repo)?;
            for row in self.inner.metadata.list_virtual_by_origin(repo)? {
                if exclude == Some(&row.repo_id) {
                    continue;
                }
                outcomes.push(self.merge_pair(&row)?);
            }
        }
        Ok(outcomes)
    }

    fn merge_pair(&self, row: &VirtualRepoRow) -> RepoResult<MergeOutcome> {
        let origin = &row.origin_repo_id;
        let virt = &row.repo_id;
        let path = RepoPath::new(&row.path)?;

        // both sides must accept commits before we start
        let store = self.writable(origin)?;
        self.writable(virt)?;

        let origin_head = self.store_err(origin, refs::get_head(&store, origin))?;
        let virt_head = self.store_err(virt, refs::get_head(&store, virt))?;

        let base = self.subtree_at(origin, &store, row.base_commit_id, &path)?;
        let theirs = self.subtree_at(origin, &store, origin_head, &path)?;
        let ours = self
            .flag_corruption(
                virt,
                crate::storage::commit::get_commit(&store, virt_head)
                    .map_err(|e| RepoError::from_storage(virt, "load head", e)),
            )?
            .root;

        if ours == theirs {
            // identical subtrees; just advance the base pointer
            if row.base_commit_id != origin_head {
                self.inner.metadata.update_virtual_base(virt, origin_head)?;
            }
            return Ok(MergeOutcome::UpToDate { repo: virt.clone() });
        }

        if ours == base {
            // only the origin moved: fast-forward the virtual head
            let commit = self.store_err(
                virt,
                CommitBuilder::new(Author::system())
                    .root(theirs)
                    .parent(virt_head)
                    .message(CommitMessage::fast_forward(origin_head))
                    .write(&store),
            )?;
            if !self.store_err(virt, refs::cas_head(&store, virt, virt_head, commit))? {
                return Err(RepoError::ConcurrentModification { repo: virt.clone() });
            }
            self.inner.metadata.update_virtual_base(virt, origin_head)?;
            return Ok(MergeOutcome::FastForwarded {
                repo: virt.clone(),
                commit,
            });
        }

        if theirs == base {
            // only the virtual side moved: graft its root into the origin,
            // pinned to the head we compared against
            let commit = self.mutate(
                origin,
                Some(origin_head),
                FileOp::ReplaceSubtree {
                    path,
                    entry: Dirent::Dir { id: ours },
                    from_repo: virt.clone(),
                },
                &Author::system(),
            )?;
            self.inner.metadata.update_virtual_base(virt, commit)?;
            return Ok(MergeOutcome::Merged {
                repo: origin.clone(),
                commit,
            });
        }

        // both sides changed: three-way reconcile
        let mut conflicts = Vec::new();
        let merged = self.flag_corruption(
            origin,
            reconcile(&store, base, ours, theirs, "", &mut conflicts)
                .map_err(|e| RepoError::from_storage(origin, "merge", e)),
        )?;
        if !conflicts.is_empty() {
            return Err(RepoError::Conflict { paths: conflicts });
        }

        let new_origin_head = self.mutate(
            origin,
            Some(origin_head),
            FileOp::ReplaceSubtree {
                path,
                entry: Dirent::Dir { id: merged },
                from_repo: virt.clone(),
            },
            &Author::system(),
        )?;

        // record the merge on the virtual side too, so its history shows
        // both lines and its root matches the new base
        let virt_commit = self.store_err(
            virt,
            CommitBuilder::new(Author::system())
                .root(merged)
                .parent(virt_head)
                .parent(origin_head)
                .message(CommitMessage::merge(origin.as_str()))
                .write(&store),
        )?;
        if !self.store_err(virt, refs::cas_head(&store, virt, virt_head, virt_commit))? {
            return Err(RepoError::ConcurrentModification { repo: virt.clone() });
        }
        self.inner
            .metadata
            .update_virtual_base(virt, new_origin_head)?;
        Ok(MergeOutcome::Merged {
            repo: virt.clone(),
            commit: virt_commit,
        })
    }
}

/// Three-way merge of directory trees, entry by entry.
///
/// Unchanged-on-one-side entries take the other side's version. Entries
/// changed to directories on both sides merge recursively. Anything else
/// that diverged lands in `conflicts` (merge output is then discarded).
fn reconcile(
    store: &ObjectStore,
    base: TreeId,
    ours: TreeId,
    theirs: TreeId,
    prefix: &str,
    conflicts: &mut Vec<String>,
) -> StorageResult<TreeId> {
    let base_tree = Tree::load(store, base)?;
    let ours_tree = Tree::load(store, ours)?;
    let theirs_tree = Tree::load(store, theirs)?;

    let mut names: Vec<&str> = ours_tree
        .iter()
        .chain(theirs_tree.iter())
        .chain(base_tree.iter())
        .map(|(name, _)| name)
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut merged = Tree::empty();
    for name in names {
        let b = base_tree.get(name).copied();
        let o = ours_tree.get(name).copied();
        let t = theirs_tree.get(name).copied();

        let take = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else if let (Some(Dirent::Dir { id: o_id }), Some(Dirent::Dir { id: t_id })) = (o, t) {
            let sub_base = match b {
                Some(Dirent::Dir { id }) => id,
                _ => tree::empty_tree_id(store)?,
            };
            let child_prefix = join_prefix(prefix, name);
            let sub = reconcile(store, sub_base, o_id, t_id, &child_prefix, conflicts)?;
            Some(Dirent::Dir { id: sub })
        } else {
            conflicts.push(join_prefix(prefix, name));
            // arbitrary, the caller throws the result away on conflict
            o
        };
        if let Some(entry) = take {
            merged.insert(name.to_string(), entry);
        }
    }
    merged.save(store)
}

fn join_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
