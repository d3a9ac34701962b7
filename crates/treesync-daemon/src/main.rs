//! TreeSync Daemon - Background synchronization service
//!
//! This binary keeps a local directory in sync with a container and handles:
//! - Reconciliation of changes made while it was not running
//! - Filesystem watching, one task per settled change
//! - Background persistence of the hash index
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon opens the local replica, starts the scheduler's worker pool,
//! then runs the index saver, the change dispatcher and the startup scan
//! side by side. All of them are controlled by a `CancellationToken` that
//! is triggered on receipt of SIGTERM or SIGINT.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use treesync_core::config::{Config, LoggingConfig};
use treesync_core::ports::TracingReporter;
use treesync_sync::container_dir::DirectoryContainer;
use treesync_sync::watcher::FileWatcher;
use treesync_sync::{
    initial_scan, ChangeDispatcher, LocalReplica, ReplicaStatus, Scheduler, SyncContext,
};

/// How often the dispatcher looks for settled change events
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Command line
// ============================================================================

/// TreeSync daemon command line
#[derive(Debug, Parser)]
#[command(
    name = "treesyncd",
    version,
    about = "Keeps a local directory in sync with a container"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory acting as the container
    #[arg(long)]
    container: Option<PathBuf>,

    /// Local directory to synchronize, overriding `sync.root`
    #[arg(long)]
    root: Option<PathBuf>,
}

impl Cli {
    /// Loads the configuration named on the command line
    ///
    /// Without `--config` the default location is tried and the built-in
    /// defaults are used if it is missing.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path).with_context(|| {
                format!("Failed to load configuration from {}", path.display())
            })?,
            None => Config::load_or_default(&Config::default_path()),
        };
        if let Some(root) = &self.root {
            config.sync.root = root.clone();
        }
        config.sync.root = expand_tilde(&config.sync.root);
        Ok(config)
    }

    fn container_dir(&self) -> PathBuf {
        self.container
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_container_dir)
    }
}

/// Replaces a leading `~` with the home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn default_container_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("treesync")
        .join("container")
}

// ============================================================================
// Logging
// ============================================================================

/// `RUST_LOG` wins over the configured level
fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
}

fn init_tracing(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(logging))
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns one replica and everything that keeps it in sync
struct DaemonService {
    /// Application configuration loaded from YAML
    config: Config,
    /// Root of the directory-backed container
    container_dir: PathBuf,
    /// Token for signalling graceful shutdown to all async tasks
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, container_dir: PathBuf, shutdown: CancellationToken) -> Self {
        Self {
            config,
            container_dir,
            shutdown,
        }
    }

    /// Checks the configuration once the sync root exists
    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.sync.root)
            .await
            .with_context(|| {
                format!(
                    "Failed to create sync root {}",
                    self.config.sync.root.display()
                )
            })?;
        tokio::fs::create_dir_all(&self.container_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create container directory {}",
                    self.container_dir.display()
                )
            })?;

        let errors = self.config.validate();
        if !errors.is_empty() {
            for e in &errors {
                error!(field = %e.field, message = %e.message, "Invalid configuration");
            }
            anyhow::bail!("Invalid configuration ({} error(s))", errors.len());
        }
        Ok(())
    }

    /// Runs the daemon until shutdown is requested
    ///
    /// 1. Opens the replica and restores its index
    /// 2. Starts the scheduler and the index saver
    /// 3. Starts watching the sync root
    /// 4. Reconciles what changed while the daemon was down
    /// 5. On shutdown, stops everything and flushes the index
    async fn run(&self) -> Result<()> {
        self.prepare().await?;

        let replica = Arc::new(
            LocalReplica::load(&self.config)
                .await
                .context("Failed to open the local replica")?,
        );
        let container = Arc::new(DirectoryContainer::new(&self.container_dir));
        let scheduler = Scheduler::new(&self.config.scheduler, Handle::current());
        scheduler.start().context("Failed to start the scheduler")?;
        let ctx = SyncContext::new(
            container,
            Arc::clone(&replica),
            scheduler.clone(),
            Arc::new(TracingReporter),
            &self.config,
        );

        let saver = tokio::spawn(Arc::clone(replica.saver()).run(self.shutdown.child_token()));

        let (mut watcher, change_rx) = FileWatcher::new(replica.root().to_path_buf())?;
        watcher.start()?;
        let mut dispatcher = ChangeDispatcher::new(
            change_rx,
            Arc::clone(&ctx),
            self.config.sync.debounce_delay(),
            DISPATCH_POLL_INTERVAL,
        );
        let dispatch_token = self.shutdown.child_token();
        let dispatch = tokio::spawn(async move { dispatcher.run(dispatch_token).await });

        replica.set_status(ReplicaStatus::Started);
        info!(
            root = %replica.root().display(),
            container = %self.container_dir.display(),
            "Replica started"
        );

        let scan_ctx = Arc::clone(&ctx);
        let scan = tokio::spawn(async move {
            match initial_scan(&scan_ctx).await {
                Ok(failures) => {
                    for failure in failures {
                        warn!(failure = %failure, "Startup task failed");
                    }
                }
                Err(e) => error!(error = %format!("{e:#}"), "Initial scan failed"),
            }
        });

        self.shutdown.cancelled().await;
        info!("Shutdown requested, stopping replica");

        if let Err(e) = watcher.stop() {
            warn!(error = %format!("{e:#}"), "Failed to stop file watcher");
        }
        if let Err(e) = dispatch.await {
            warn!(error = %e, "Change dispatcher ended abnormally");
        }
        scan.abort();

        // Joins worker threads
        let stopping = scheduler.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
            warn!(error = %e, "Failed to stop the scheduler");
        }

        replica.set_status(ReplicaStatus::Stopped);
        if let Err(e) = saver.await {
            warn!(error = %e, "Index saver ended abnormally");
        }
        Ok(())
    }
}

// ============================================================================
// Signal handling
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
///
/// A signal whose handler cannot be installed is logged and ignored.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "TreeSync daemon starting (treesyncd)"
    );

    let shutdown_token = CancellationToken::new();

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, cli.container_dir(), shutdown_token);
    let result = service.run().await;

    match &result {
        Ok(()) => info!("TreeSync daemon shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "TreeSync daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
