//! Configuration module for TreeSync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for TreeSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
    pub quota: QuotaConfig,
    pub index: IndexConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local replica.
    pub root: PathBuf,
    /// Skip files and directories whose name starts with a dot.
    pub exclude_hidden_files: bool,
    /// Quiet period (milliseconds) a watched path must observe before its
    /// change is turned into a task.
    pub debounce_ms: u64,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads driving tasks.
    pub workers: usize,
    /// Maximum number of started-but-unfinished tasks.
    pub max_in_flight: usize,
}

/// Quota exhaustion handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Seconds an upload-bearing task waits before running while the
    /// replica is in the quota-exceeded state.
    pub retry_delay_secs: u64,
}

/// Hash index persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Name of the index file, stored at the root of the replica.
    pub file_name: String,
    /// Quiet period (milliseconds) before a pending save is written.
    pub save_delay_ms: u64,
    /// How many times a pending save may be postponed by new changes.
    pub max_save_delays: u32,
    /// How many times a failed save is retried.
    pub max_save_retries: u32,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/treesync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("treesync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("TreeSync"),
            exclude_hidden_files: true,
            debounce_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_in_flight: 100,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 300,
        }
    }
}

impl QuotaConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            file_name: ".treesync-index.json".to_string(),
            save_delay_ms: 1000,
            max_save_delays: 30,
            max_save_retries: 6,
        }
    }
}

impl IndexConfig {
    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"scheduler.workers"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        // Tilde is expanded at runtime, so only literal paths are checked.
        let root_str = self.sync.root.to_string_lossy();
        if !root_str.starts_with('~') && !self.sync.root.is_dir() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("directory does not exist: {}", self.sync.root.display()),
            });
        }

        // --- scheduler ---
        if self.scheduler.workers == 0 {
            errors.push(ValidationError {
                field: "scheduler.workers".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.scheduler.max_in_flight == 0 {
            errors.push(ValidationError {
                field: "scheduler.max_in_flight".into(),
                message: "must be greater than 0".into(),
            });
        } else if self.scheduler.max_in_flight < self.scheduler.workers {
            errors.push(ValidationError {
                field: "scheduler.max_in_flight".into(),
                message: format!(
                    "max_in_flight ({}) must not be lower than workers ({})",
                    self.scheduler.max_in_flight, self.scheduler.workers
                ),
            });
        }

        // --- index ---
        if self.index.file_name.trim().is_empty() || self.index.file_name.contains('/') {
            errors.push(ValidationError {
                field: "index.file_name".into(),
                message: "must be a plain, non-empty file name".into(),
            });
        }
        if self.index.max_save_retries == 0 {
            errors.push(ValidationError {
                field: "index.max_save_retries".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use treesync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/TreeSync"))
///     .scheduler_workers(8)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_exclude_hidden_files(mut self, exclude: bool) -> Self {
        self.config.sync.exclude_hidden_files = exclude;
        self
    }

    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    // --- scheduler ---

    pub fn scheduler_workers(mut self, n: usize) -> Self {
        self.config.scheduler.workers = n;
        self
    }

    pub fn scheduler_max_in_flight(mut self, n: usize) -> Self {
        self.config.scheduler.max_in_flight = n;
        self
    }

    // --- quota ---

    pub fn quota_retry_delay_secs(mut self, seconds: u64) -> Self {
        self.config.quota.retry_delay_secs = seconds;
        self
    }

    // --- index ---

    pub fn index_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.index.file_name = name.into();
        self
    }

    pub fn index_save_delay_ms(mut self, ms: u64) -> Self {
        self.config.index.save_delay_ms = ms;
        self
    }

    pub fn index_max_save_delays(mut self, n: u32) -> Self {
        self.config.index.max_save_delays = n;
        self
    }

    pub fn index_max_save_retries(mut self, n: u32) -> Self {
        self.config.index.max_save_retries = n;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
