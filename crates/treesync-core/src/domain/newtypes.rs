//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for the values that flow
//! between the index, the tasks and the storage ports. Each newtype ensures
//! data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Path types
// ============================================================================

/// A normalized path relative to the sync root
///
/// RelPath ensures the path is:
/// - Relative (a leading `/` or `./` is stripped)
/// - Normalized (empty and `.` segments dropped, `..` rejected)
/// - `/`-separated regardless of platform
///
/// The root itself is the empty path and displays as `.`. Ordering is the
/// plain lexicographic order of the normalized string, which is the order
/// multi-path lock acquisition relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// Create a new RelPath from a `/`-separated string
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if a segment is `..` or contains NUL
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref();
        let mut parts = Vec::new();
        for part in Self::split(raw) {
            if part == ".." || part.contains('\0') {
                return Err(DomainError::InvalidPath(raw.to_string()));
            }
            parts.push(part);
        }
        Ok(Self(parts.join("/")))
    }

    /// The sync root
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Split a raw path into its meaningful segments
    ///
    /// `"./a//b/"` yields `["a", "b"]`.
    pub fn split(raw: &str) -> impl Iterator<Item = &str> {
        raw.split('/').filter(|part| !part.is_empty() && *part != ".")
    }

    /// Build a RelPath from an absolute path inside `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInSyncRoot` if `absolute` is outside `root`
    pub fn from_absolute(root: &Path, absolute: &Path) -> Result<Self, DomainError> {
        let relative = absolute.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInSyncRoot(absolute.display().to_string())
        })?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(
                        relative.display().to_string(),
                    ))
                }
            }
        }
        Ok(Self(parts.join("/")))
    }

    /// Get the normalized string (empty for the root)
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the sync root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the path segments
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|p| !p.is_empty())
    }

    /// Last segment, `None` for the root
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.parts().last()
    }

    /// Parent path, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Append one or more segments
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if `child` is not a valid relative path
    pub fn join(&self, child: &str) -> Result<Self, DomainError> {
        let child = Self::new(child)?;
        if self.is_root() {
            return Ok(child);
        }
        if child.is_root() {
            return Ok(self.clone());
        }
        Ok(Self(format!("{}/{}", self.0, child.0)))
    }

    /// Component-wise prefix test (`a/b` is under `a`, `ab` is not)
    #[must_use]
    pub fn starts_with(&self, prefix: &RelPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0[prefix.0.len()..].starts_with('/'))
    }

    /// Resolve against a local root directory
    #[must_use]
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.parts() {
            path.push(part);
        }
        path
    }
}

impl Display for RelPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RelPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelPath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RelPath {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RelPath> for String {
    fn from(path: RelPath) -> Self {
        path.0
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Hash types
// ============================================================================

/// The last known content hashes of a file
///
/// `local` is the hash of the local content at the last reconciliation,
/// `remote` is the container's metadata hash at that moment. Either side may
/// be absent, meaning "unknown or invalidated": the next task touching the
/// file has to re-compare that side from scratch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashPair {
    pub local: Option<String>,
    pub remote: Option<String>,
}

impl HashPair {
    /// Create a pair from both sides
    #[must_use]
    pub fn new(local: Option<String>, remote: Option<String>) -> Self {
        Self { local, remote }
    }

    /// Pair with both sides known
    #[must_use]
    pub fn known(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: Some(local.into()),
            remote: Some(remote.into()),
        }
    }

    /// Pair with both sides unknown (the file is gone on both sides)
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    /// Whether neither side is known
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }
}

impl Display for HashPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.local.as_deref().unwrap_or("-"),
            self.remote.as_deref().unwrap_or("-")
        )
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod rel_path_tests {
        use super::*;

        #[test]
        fn test_normalizes_separators() {
            let path = RelPath::new("./a//b/c/").unwrap();
            assert_eq!(path.as_str(), "a/b/c");

            let path = RelPath::new("/a/./b").unwrap();
            assert_eq!(path.as_str(), "a/b");
        }

        #[test]
        fn test_rejects_parent_segments() {
            assert!(RelPath::new("a/../b").is_err());
            assert!(RelPath::new("..").is_err());
        }

        #[test]
        fn test_root() {
            let root = RelPath::new("./").unwrap();
            assert!(root.is_root());
            assert_eq!(root, RelPath::root());
            assert_eq!(root.to_string(), ".");
            assert!(root.parent().is_none());
            assert!(root.file_name().is_none());
        }

        #[test]
        fn test_parent_and_file_name() {
            let path = RelPath::new("a/b/c.txt").unwrap();
            assert_eq!(path.file_name(), Some("c.txt"));
            assert_eq!(path.parent().unwrap().as_str(), "a/b");

            let top = RelPath::new("c.txt").unwrap();
            assert!(top.parent().unwrap().is_root());
        }

        #[test]
        fn test_join() {
            let dir = RelPath::new("a").unwrap();
            assert_eq!(dir.join("b/c").unwrap().as_str(), "a/b/c");
            assert_eq!(RelPath::root().join("x").unwrap().as_str(), "x");
            assert!(dir.join("../x").is_err());
        }

        #[test]
        fn test_starts_with_is_component_wise() {
            let path = RelPath::new("ab/c").unwrap();
            assert!(path.starts_with(&RelPath::new("ab").unwrap()));
            assert!(!path.starts_with(&RelPath::new("a").unwrap()));
            assert!(path.starts_with(&RelPath::root()));
            assert!(path.starts_with(&path));
        }

        #[test]
        fn test_ordering_is_lexicographic() {
            let mut paths = vec![
                RelPath::new("b").unwrap(),
                RelPath::new("a/z").unwrap(),
                RelPath::new("a").unwrap(),
            ];
            paths.sort();
            let sorted: Vec<&str> = paths.iter().map(RelPath::as_str).collect();
            assert_eq!(sorted, vec!["a", "a/z", "b"]);
        }

        #[test]
        fn test_from_absolute() {
            let root = Path::new("/home/user/sync");
            let path =
                RelPath::from_absolute(root, Path::new("/home/user/sync/docs/x.txt")).unwrap();
            assert_eq!(path.as_str(), "docs/x.txt");
            assert_eq!(path.to_path(root), PathBuf::from("/home/user/sync/docs/x.txt"));

            let outside = RelPath::from_absolute(root, Path::new("/etc/passwd"));
            assert!(matches!(outside, Err(DomainError::PathNotInSyncRoot(_))));
        }

        #[test]
        fn test_deserialize_normalizes_and_validates() {
            let path: RelPath = serde_yaml::from_str("./a//b").unwrap();
            assert_eq!(path.as_str(), "a/b");

            let bad: Result<RelPath, _> = serde_yaml::from_str("a/../b");
            assert!(bad.is_err());
        }
    }

    mod hash_pair_tests {
        use super::*;

        #[test]
        fn test_absent() {
            assert!(HashPair::absent().is_absent());
            assert!(!HashPair::new(Some("l".into()), None).is_absent());
        }

        #[test]
        fn test_display() {
            assert_eq!(HashPair::known("l", "r").to_string(), "(l, r)");
            assert_eq!(HashPair::absent().to_string(), "(-, -)");
        }
    }
}
