//! Domain error types

use thiserror::Error;

/// Errors that can occur while building domain values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Absolute path is not inside the sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("../escape".to_string());
        assert_eq!(err.to_string(), "Invalid path: ../escape");

        let err = DomainError::PathNotInSyncRoot("/etc/passwd".to_string());
        assert_eq!(err.to_string(), "Path not within sync root: /etc/passwd");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidPath("a".to_string());
        let err2 = DomainError::InvalidPath("a".to_string());
        let err3 = DomainError::InvalidPath("b".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
