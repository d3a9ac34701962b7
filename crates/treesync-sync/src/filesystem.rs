//! Local filesystem adapter
//!
//! Every operation takes a [`RelPath`] and resolves it against the sync
//! root, using `tokio::fs` for async file operations.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: Uses write-to-temp + rename to avoid partial writes
//!   on crash or power loss.
//! - **Missing files are values**: reads, hashes and deletes of an absent
//!   file return `None`/`false` instead of an error, since the tasks branch
//!   on that outcome.
//! - **SHA-256**: content hashes are lowercase hex, computed in 64 KiB
//!   chunks so large files are never loaded at once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};
use treesync_core::domain::newtypes::RelPath;

use crate::filter::TMP_SUFFIX;

/// Size of the read buffer used while hashing
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Directory,
}

/// Adapter over the local replica's directory
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

/// Hex SHA-256 of an in-memory buffer
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut p = target.as_os_str().to_owned();
    p.push(TMP_SUFFIX);
    PathBuf::from(p)
}

impl LocalFiles {
    /// Create an adapter rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `path`
    pub fn resolve(&self, path: &RelPath) -> PathBuf {
        path.to_path(&self.root)
    }

    /// Whether a regular file exists at `path`
    pub async fn is_file(&self, path: &RelPath) -> bool {
        tokio::fs::metadata(self.resolve(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Whether anything exists at `path`
    pub async fn exists(&self, path: &RelPath) -> bool {
        tokio::fs::symlink_metadata(self.resolve(path)).await.is_ok()
    }

    /// Reads a whole file, `None` if it does not exist
    #[instrument(skip(self), fields(path = %path))]
    pub async fn read(&self, path: &RelPath) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(data) => {
                debug!(bytes = data.len(), "file read complete");
                Ok(Some(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Hashes a file, `None` if it does not exist
    #[instrument(skip(self), fields(path = %path))]
    pub async fn hash(&self, path: &RelPath) -> std::io::Result<Option<String>> {
        let mut file = match tokio::fs::File::open(self.resolve(path)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hex(&hasher.finalize());
        debug!(hash = %digest, "hash computed");
        Ok(Some(digest))
    }

    /// Writes `data` atomically, creating parent directories
    ///
    /// # Returns
    /// The hash of the written content
    #[instrument(skip(self, data), fields(path = %path, bytes = data.len()))]
    pub async fn write(&self, path: &RelPath, data: &[u8]) -> std::io::Result<String> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Same directory, so the rename stays on one filesystem.
        let tmp = tmp_path(&target);
        debug!(?tmp, "writing to temporary file");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!("write complete");
        Ok(hash_bytes(data))
    }

    /// Renames a file, creating the destination's parents
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn rename(&self, from: &RelPath, to: &RelPath) -> std::io::Result<()> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(from), target).await
    }

    /// Removes a file
    ///
    /// # Returns
    /// `false` if there was nothing to remove
    #[instrument(skip(self), fields(path = %path))]
    pub async fn remove(&self, path: &RelPath) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => {
                debug!("removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists a directory, `None` if it does not exist
    ///
    /// Entries are sorted by name. Symlinks and special files are skipped.
    pub async fn list_dir(
        &self,
        path: &RelPath,
    ) -> std::io::Result<Option<Vec<(String, EntryKind)>>> {
        let mut dir = match tokio::fs::read_dir(self.resolve(path)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                // Vanished between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!(path = ?entry.path(), "Non-regular file ignored");
                continue;
            };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        entries.sort();
        Ok(Some(entries))
    }
}

// ============================================================================
// Unit tests
// ============================================================================
