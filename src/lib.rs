//! repovault is a repository engine for file-synchronization services:
//! immutable commit graphs over content-addressed trees, with an atomic
//! compare-and-swap mutation pipeline and virtual repositories that expose
//! a subtree of an origin as a repository of its own.
//!
//! The storage model is a bare git object database per repository. Trees
//! and commits are canonical-JSON blobs, so object identity is the hash of
//! the content and every commit shares unchanged subtrees with its parent.
//! The only mutable state is one branch head per repository, moved solely
//! by compare-and-swap.
//!
//! ```no_run
//! use repovault::repo::RepoEngine;
//! use repovault::storage::Author;
//!
//! # fn main() -> Result<(), repovault::repo::RepoError> {
//! let engine = RepoEngine::with_memory_metadata("/var/lib/repovault");
//! let author = Author::new("alice", "alice@example.com");
//!
//! let repo = engine.create_repo("notes", "my notes", "alice", None)?;
//! engine.post_file(&repo, "", "hello.txt", b"hi", false, &author)?;
//! assert_eq!(engine.read_file(&repo, "hello.txt")?, b"hi");
//! # Ok(())
//! # }
//! ```

pub mod metadata;
pub mod repo;
pub mod storage;

pub use metadata::{MemoryMetadataStore, MetadataStore, RepoStatus};
pub use repo::{MergeOutcome, RepoEngine, RepoError, RepoResult};
pub use storage::{Author, CommitId, FileId, RepoId};
