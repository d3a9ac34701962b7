//! Error display port
//!
//! Failures that the user should hear about are routed through an
//! [`ErrorReporter`] with one category each. Delivery is fire-and-forget:
//! the caller never waits on the user.

use serde::{Deserialize, Serialize};
use tracing::error;

/// Failure category shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The remote storage quota is exhausted
    Quota,
    /// A local or remote I/O operation failed
    Io,
    /// Any other synchronization failure
    Sync,
}

impl ErrorCategory {
    /// The message displayed for this category
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCategory::Quota => "Quota limit reached",
            ErrorCategory::Io => "An error occurred while transferring a file",
            ErrorCategory::Sync => "An error occurred during synchronization",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Quota => "quota",
            ErrorCategory::Io => "io",
            ErrorCategory::Sync => "sync",
        };
        write!(f, "{}", s)
    }
}

/// Port trait for displaying errors to the user
pub trait ErrorReporter: Send + Sync {
    /// Displays an error
    ///
    /// # Arguments
    /// * `category` - Which kind of failure happened
    /// * `detail` - Technical detail (path, underlying error)
    fn report(&self, category: ErrorCategory, detail: &str);
}

/// Reporter that only writes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, category: ErrorCategory, detail: &str) {
        error!(
            category = %category,
            detail = %detail,
            "{}",
            category.default_message()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Quota.to_string(), "quota");
        assert_eq!(ErrorCategory::Io.to_string(), "io");
        assert_eq!(ErrorCategory::Sync.to_string(), "sync");
    }

    #[test]
    fn test_quota_message() {
        assert_eq!(ErrorCategory::Quota.default_message(), "Quota limit reached");
    }

    #[test]
    fn test_tracing_reporter_does_not_panic() {
        TracingReporter.report(ErrorCategory::Io, "a.txt: broken pipe");
    }
}
