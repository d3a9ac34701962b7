//! Shared test helpers for the sync engine integration tests
//!
//! [`MemoryContainer`] is an in-memory [`Container`] that counts calls and
//! can hold every transfer behind a semaphore. [`Harness`] wires it to a
//! temporary local replica and a running scheduler.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use treesync_core::config::{Config, ConfigBuilder};
use treesync_core::domain::newtypes::{HashPair, RelPath};
use treesync_core::ports::{
    Container, ContainerError, ContainerResult, ErrorCategory, ErrorReporter, RemoteFile,
    RemoteInfo,
};
use treesync_sync::filesystem::hash_bytes;
use treesync_sync::index::IndexTree;
use treesync_sync::{LocalReplica, Scheduler, SyncContext, TaskOutcome, TaskTicket};

pub fn rel(p: &str) -> RelPath {
    RelPath::new(p).unwrap()
}

// ============================================================================
// MemoryContainer
// ============================================================================

#[derive(Debug, Default)]
pub struct CallCounts {
    pub info: AtomicUsize,
    pub download: AtomicUsize,
    pub upload: AtomicUsize,
    pub remove: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.info.load(Ordering::SeqCst)
            + self.download.load(Ordering::SeqCst)
            + self.upload.load(Ordering::SeqCst)
            + self.remove.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.upload.load(Ordering::SeqCst)
    }
}

/// Remote store kept in memory
///
/// Remote hashes are version tags (`v1`, `v2`, ...) so tests can tell them
/// apart from local content hashes.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    files: Mutex<BTreeMap<RelPath, (String, Vec<u8>)>>,
    version: AtomicUsize,
    pub calls: CallCounts,
    quota_exceeded: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryContainer {
    /// Stores `content` at `path` without counting a call
    pub fn put(&self, path: &str, content: &[u8]) -> String {
        let hash = format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1);
        self.files
            .lock()
            .unwrap()
            .insert(rel(path), (hash.clone(), content.to_vec()));
        hash
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&rel(path))
            .map(|(_, content)| content.clone())
    }

    pub fn hash(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&rel(path))
            .map(|(hash, _)| hash.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .keys()
            .map(|path| path.to_string())
            .collect()
    }

    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.quota_exceeded.store(exceeded, Ordering::SeqCst);
    }

    /// Makes every later call wait for a permit of the returned semaphore
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn lookup(&self, path: &RelPath) -> ContainerResult<(String, Vec<u8>)> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound(path.clone()))
    }
}

#[async_trait]
impl Container for MemoryContainer {
    async fn list_files(&self) -> ContainerResult<Vec<RemoteFile>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (hash, _))| RemoteFile {
                name: name.clone(),
                hash: hash.clone(),
            })
            .collect())
    }

    async fn get_info_file(&self, path: &RelPath) -> ContainerResult<RemoteInfo> {
        self.calls.info.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        let (hash, _) = self.lookup(path)?;
        Ok(RemoteInfo::new(hash))
    }

    async fn download(&self, path: &RelPath) -> ContainerResult<(RemoteInfo, Vec<u8>)> {
        self.calls.download.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        let (hash, content) = self.lookup(path)?;
        Ok((RemoteInfo::new(hash), content))
    }

    async fn upload(&self, path: &RelPath, content: Vec<u8>) -> ContainerResult<RemoteInfo> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(ContainerError::QuotaExceeded);
        }
        let hash = self.put(path.as_str(), &content);
        Ok(RemoteInfo::new(hash))
    }

    async fn remove_file(&self, path: &RelPath) -> ContainerResult<()> {
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        match self.files.lock().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(ContainerError::NotFound(path.clone())),
        }
    }
}

// ============================================================================
// RecordingReporter
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingReporter(pub Mutex<Vec<ErrorCategory>>);

impl RecordingReporter {
    pub fn categories(&self) -> Vec<ErrorCategory> {
        self.0.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, category: ErrorCategory, _detail: &str) {
        self.0.lock().unwrap().push(category);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub local: TempDir,
    pub remote: Arc<MemoryContainer>,
    pub reporter: Arc<RecordingReporter>,
    pub ctx: Arc<SyncContext>,
}

impl Harness {
    pub fn new(entries: Vec<(RelPath, HashPair)>) -> Self {
        Self::with_config(entries, |builder| builder)
    }

    pub fn with_config(
        entries: Vec<(RelPath, HashPair)>,
        configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> Self {
        let local = TempDir::new().unwrap();
        let config: Config = configure(
            ConfigBuilder::new()
                .sync_root(local.path().to_path_buf())
                .quota_retry_delay_secs(0),
        )
        .build();

        let remote = Arc::new(MemoryContainer::default());
        let reporter = Arc::new(RecordingReporter::default());
        let replica = LocalReplica::new(local.path(), IndexTree::from_entries(entries), &config);
        let scheduler = Scheduler::new(&config.scheduler, Handle::current());
        scheduler.start().unwrap();
        let ctx = SyncContext::new(
            remote.clone(),
            Arc::new(replica),
            scheduler,
            reporter.clone(),
            &config,
        );
        Self {
            local,
            remote,
            reporter,
            ctx,
        }
    }

    pub fn path(&self, p: &str) -> PathBuf {
        self.local.path().join(p)
    }

    pub fn write_local(&self, p: &str, content: &[u8]) -> String {
        let path = self.path(p);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        hash_bytes(content)
    }

    pub fn read_local(&self, p: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(p)).ok()
    }

    /// Names of the files directly inside `dir` of the local replica
    pub fn local_names(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(dir))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn hashes(&self, p: &str) -> Option<HashPair> {
        self.ctx.replica().index().hashes(&rel(p))
    }

    /// Schedules `ticket` and waits for it and its subtasks
    pub async fn run(&self, ticket: TaskTicket) -> TaskOutcome {
        let handle = self.ctx.spawn(ticket.share(), false).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("task did not finish")
    }

    /// Polls `condition` until it holds, failing after a few seconds
    pub async fn wait_until(&self, mut condition: impl FnMut(&Self) -> bool) {
        for _ in 0..500 {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.scheduler().stop();
    }
}
