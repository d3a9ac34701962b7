//! Remote container port (driven/secondary port)
//!
//! This module defines the interface to the remote object store the local
//! replica is reconciled against. The store is authoritative; the sync
//! engine only ever reads metadata, downloads, uploads and deletes whole
//! files through it.
//!
//! ## Design Notes
//!
//! - Uses a classified [`ContainerError`] instead of a bare `anyhow::Error`
//!   because tasks branch on "not found" and "quota exceeded".
//! - Uses `#[async_trait]` for async trait methods.
//! - Content travels as an owned byte buffer; chunked transfer is an
//!   adapter concern.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::newtypes::RelPath;

// ============================================================================
// Remote metadata DTOs
// ============================================================================

/// One entry of a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Path of the file relative to the container root
    pub name: RelPath,
    /// Container metadata hash of the stored content
    pub hash: String,
}

/// Metadata returned by `get_info_file`, `download` and `upload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// Container metadata hash of the stored content
    ///
    /// Opaque: only ever compared with other remote hashes.
    pub hash: String,
}

impl RemoteInfo {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

// ============================================================================
// ContainerError
// ============================================================================

/// Errors reported by a [`Container`] implementation
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The file does not exist remotely
    ///
    /// Expected during reconciliation: it means "already gone".
    #[error("remote file not found: {0}")]
    NotFound(RelPath),

    /// The account ran out of storage
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Any other adapter-specific failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ContainerError {
    /// Returns true for the "already gone" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound(_))
    }
}

/// Result alias for container operations
pub type ContainerResult<T> = Result<T, ContainerError>;

// ============================================================================
// Container trait
// ============================================================================

/// Port trait for the remote object store
///
/// ## Implementation Notes
///
/// - `get_info_file`, `download` and `remove_file` must fail with
///   [`ContainerError::NotFound`] when the file is absent.
/// - `upload` creates or replaces the file and returns its new metadata.
/// - Implementations must be safe to call from many tasks at once.
#[async_trait::async_trait]
pub trait Container: Send + Sync {
    /// Lists every file stored in the container
    async fn list_files(&self) -> ContainerResult<Vec<RemoteFile>>;

    /// Fetches the metadata of a single file
    ///
    /// # Arguments
    /// * `path` - Path of the file relative to the container root
    async fn get_info_file(&self, path: &RelPath) -> ContainerResult<RemoteInfo>;

    /// Downloads a file's metadata and content
    ///
    /// # Arguments
    /// * `path` - Path of the file relative to the container root
    ///
    /// # Returns
    /// The metadata and the full content of the file
    async fn download(&self, path: &RelPath) -> ContainerResult<(RemoteInfo, Vec<u8>)>;

    /// Uploads a file, creating or replacing it
    ///
    /// # Arguments
    /// * `path` - Destination path relative to the container root
    /// * `content` - The full file content
    async fn upload(&self, path: &RelPath, content: Vec<u8>) -> ContainerResult<RemoteInfo>;

    /// Deletes a file
    ///
    /// # Arguments
    /// * `path` - Path of the file relative to the container root
    async fn remove_file(&self, path: &RelPath) -> ContainerResult<()>;
}
