//! A [`Container`] backed by a plain local directory
//!
//! Lets two folders be kept in sync without any network service. The
//! metadata hash of a file is the SHA-256 of its content.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, instrument};
use treesync_core::domain::newtypes::RelPath;
use treesync_core::ports::{Container, ContainerError, ContainerResult, RemoteFile, RemoteInfo};

use crate::filesystem::{EntryKind, LocalFiles};
use crate::filter::is_path_allowed;

/// Directory standing in for a remote container
#[derive(Debug, Clone)]
pub struct DirectoryContainer {
    files: LocalFiles,
}

impl DirectoryContainer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            files: LocalFiles::new(root),
        }
    }
}

fn io_error(path: &RelPath, e: std::io::Error) -> ContainerError {
    ContainerError::Other(anyhow::Error::new(e).context(format!("container I/O on {}", path)))
}

#[async_trait]
impl Container for DirectoryContainer {
    async fn list_files(&self) -> ContainerResult<Vec<RemoteFile>> {
        let mut found = Vec::new();
        let mut pending = vec![RelPath::root()];
        while let Some(dir) = pending.pop() {
            let entries = self
                .files
                .list_dir(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?
                .unwrap_or_default();
            for (name, kind) in entries {
                let path = dir
                    .join(&name)
                    .with_context(|| format!("invalid entry name {:?}", name))?;
                match kind {
                    EntryKind::Directory => pending.push(path),
                    EntryKind::File if is_path_allowed(&path) => {
                        if let Some(hash) =
                            self.files.hash(&path).await.map_err(|e| io_error(&path, e))?
                        {
                            found.push(RemoteFile { name: path, hash });
                        }
                    }
                    EntryKind::File => {}
                }
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn get_info_file(&self, path: &RelPath) -> ContainerResult<RemoteInfo> {
        match self.files.hash(path).await.map_err(|e| io_error(path, e))? {
            Some(hash) => Ok(RemoteInfo::new(hash)),
            None => Err(ContainerError::NotFound(path.clone())),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn download(&self, path: &RelPath) -> ContainerResult<(RemoteInfo, Vec<u8>)> {
        let content = self
            .files
            .read(path)
            .await
            .map_err(|e| io_error(path, e))?
            .ok_or_else(|| ContainerError::NotFound(path.clone()))?;
        let info = RemoteInfo::new(crate::filesystem::hash_bytes(&content));
        debug!(bytes = content.len(), "Downloaded");
        Ok((info, content))
    }

    #[instrument(skip(self, content), fields(path = %path, bytes = content.len()))]
    async fn upload(&self, path: &RelPath, content: Vec<u8>) -> ContainerResult<RemoteInfo> {
        let hash = self
            .files
            .write(path, &content)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(RemoteInfo::new(hash))
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn remove_file(&self, path: &RelPath) -> ContainerResult<()> {
        if self.files.remove(path).await.map_err(|e| io_error(path, e))? {
            Ok(())
        } else {
            Err(ContainerError::NotFound(path.clone()))
        }
    }
}
