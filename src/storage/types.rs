//! core type-safe wrappers around store primitives.
//!
//! Identifiers follow the service's wire format: repository ids are 36-char
//! lowercase hyphenated UUIDs, object/commit/tree/file ids are 40-char
//! lowercase hex digests. The newtypes keep the raw `git2::Oid` private to
//! the storage module so a tree id can't be passed where a commit id is
//! expected.

use std::fmt;

use git2::Oid;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A validated repository identifier: 36-character lowercase hyphenated UUID.
///
/// Stable for the lifetime of the repository. Also used as a store id (the
/// namespace a repository's objects resolve against).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(String);

impl RepoId {
    /// create a RepoId, validating the UUID shape
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// generate a fresh v4 id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    fn validate(id: &str) -> Result<(), InvalidNameError> {
        if id.len() != 36 {
            return Err(InvalidNameError::InvalidRepoId(id.to_string()));
        }
        for (i, c) in id.chars().enumerate() {
            let hyphen = matches!(i, 8 | 13 | 18 | 23);
            let ok = if hyphen {
                c == '-'
            } else {
                c.is_ascii_hexdigit() && !c.is_ascii_uppercase()
            };
            if !ok {
                return Err(InvalidNameError::InvalidRepoId(id.to_string()));
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RepoId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RepoId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        RepoId::new(s).map_err(D::Error::custom)
    }
}

/// Untyped content-address of an object in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub(crate) Oid);

impl ObjectId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// parse from a 40-char hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(ObjectId)
    }

    /// the all-zero id (never stored; useful as a sentinel in tests)
    pub fn zero() -> Self {
        Self(Oid::zero())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit identifier: content hash of the serialized commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    pub fn as_object(&self) -> ObjectId {
        ObjectId(self.0)
    }

    /// short form, for commit messages and logs
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CommitId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Oid::from_str(&s).map(CommitId).map_err(D::Error::custom)
    }
}

/// Tree identifier: content hash of the serialized directory listing.
///
/// Two directories with identical contents share one id, which is what gives
/// copy-on-write sharing across commits and across virtual/origin trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(TreeId)
    }

    pub fn as_object(&self) -> ObjectId {
        ObjectId(self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TreeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TreeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Oid::from_str(&s).map(TreeId).map_err(D::Error::custom)
    }
}

/// File content identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) Oid);

impl FileId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(FileId)
    }

    pub fn as_object(&self) -> ObjectId {
        ObjectId(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Oid::from_str(&s).map(FileId).map_err(D::Error::custom)
    }
}

/// A validated directory entry name.
///
/// Names are stored as tree keys and surfaced to sync clients on every
/// platform, so the policy is the strictest common denominator:
/// - 1-255 bytes
/// - no `/`, `\`, NUL or other control characters
/// - none of `" : * ? < > |`
/// - not `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileName(String);

impl FileName {
    const RESERVED_CHARS: &'static [char] = &['/', '\\', '"', ':', '*', '?', '<', '>', '|'];

    /// create a new FileName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Validate an entry name.
    pub fn validate(name: &str) -> Result<(), InvalidNameError> {
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > 255 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if name == "." || name == ".." {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }
        for c in name.chars() {
            if c.is_control() || Self::RESERVED_CHARS.contains(&c) {
                return Err(InvalidNameError::ReservedCharacter(c));
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A normalized, slash-separated repository path.
///
/// The root directory is the empty path. Constructors collapse duplicate
/// separators, strip leading/trailing slashes, and reject `.`/`..` segments
/// and invalid entry names outright.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoPath(String);

impl RepoPath {
    /// the root path (empty)
    pub fn root() -> Self {
        Self(String::new())
    }

    /// parse and normalize a path
    pub fn new(path: impl AsRef<str>) -> Result<Self, InvalidNameError> {
        let mut segments = Vec::new();
        for seg in path.as_ref().split('/') {
            if seg.is_empty() {
                continue;
            }
            if seg == "." || seg == ".." {
                return Err(InvalidNameError::InvalidPath(path.as_ref().to_string()));
            }
            FileName::validate(seg)?;
            segments.push(seg);
        }
        Ok(Self(segments.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// path segments, in order; empty for the root
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// split into (parent dir, final segment); None for the root
    pub fn split_last(&self) -> Option<(RepoPath, &str)> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, name)) => Some((RepoPath(parent.to_string()), name)),
            None => Some((RepoPath::root(), self.0.as_str())),
        }
    }

    /// the final segment; None for the root
    pub fn file_name(&self) -> Option<&str> {
        self.split_last().map(|(_, name)| name)
    }

    /// the containing directory; None for the root
    pub fn parent(&self) -> Option<RepoPath> {
        self.split_last().map(|(parent, _)| parent)
    }

    /// append a validated name
    pub fn join(&self, name: &FileName) -> RepoPath {
        if self.is_root() {
            RepoPath(name.as_str().to_string())
        } else {
            RepoPath(format!("{}/{}", self.0, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// commit author/modifier identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// identity used for engine-internal commits (merges, seeds)
    pub fn system() -> Self {
        Self::new("repovault", "system@repovault")
    }
}

/// error type for invalid ids, names and paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    ReservedCharacter(char),
    Reserved(String),
    InvalidPath(String),
    InvalidRepoId(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} bytes", len),
            Self::ReservedCharacter(c) => write!(f, "name contains reserved character {:?}", c),
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            Self::InvalidRepoId(id) => write!(f, "invalid repository id: '{}'", id),
        }
    }
}

impl std::error::Error for InvalidNameError {}
