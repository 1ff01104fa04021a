//! Error types for the migration engine.
//!
//! The variants follow the migration failure taxonomy: transient store errors are
//! retried with a fixed interval, `AlreadyExists` is resolved by reusing the existing
//! entity, `NotFound` fails a single child, and `SequenceMismatch` / `Config` abort a
//! parent (or the whole run, when raised before scheduling).

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mlmigrate.
#[derive(Debug, Error)]
pub enum MigrateError {
    // Store errors
    #[error("Transient store error: {message}")]
    Transient {
        message: String,
        /// HTTP status, when the error came from a remote store
        status: Option<u16>,
    },

    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: String, name: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Store rejected request: {message}")]
    Store {
        message: String,
        error_code: Option<String>,
    },

    // Registry errors
    #[error(
        "Version mismatch for '{parent}': source version {expected} was created as version {actual}"
    )]
    SequenceMismatch {
        parent: String,
        expected: u64,
        actual: u64,
    },

    // Child-level failure surfaced to a parent that cannot continue without it
    #[error("Child {child} of '{parent}' failed: {reason}")]
    ChildFailed {
        parent: String,
        child: String,
        reason: String,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return MigrateError::Transient {
                message: err.to_string(),
                status,
            };
        }
        match status {
            Some(code) if code == 429 || code >= 500 => MigrateError::Transient {
                message: err.to_string(),
                status,
            },
            _ => MigrateError::Store {
                message: err.to_string(),
                error_code: None,
            },
        }
    }
}

impl MigrateError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        MigrateError::Io {
            message: format!("{}: {}", path.display(), err),
            path: Some(path),
            source: Some(err),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        MigrateError::Config {
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        MigrateError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        MigrateError::Transient {
            message: message.into(),
            status: None,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::Transient { .. })
    }

    /// Check if this error must abort the whole parent rather than a single child.
    pub fn is_fatal_for_parent(&self) -> bool {
        matches!(
            self,
            MigrateError::SequenceMismatch { .. }
                | MigrateError::ChildFailed { .. }
                | MigrateError::Config { .. }
                | MigrateError::Io { .. }
                | MigrateError::Json { .. }
                | MigrateError::Cancelled
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, MigrateError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MigrateError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrateError::SequenceMismatch {
            parent: "churn-model".into(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Version mismatch for 'churn-model': source version 3 was created as version 4"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MigrateError::transient("rate limited").is_retryable());
        assert!(!MigrateError::not_found("run", "r1").is_retryable());
        assert!(!MigrateError::config("bad").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MigrateError::SequenceMismatch {
            parent: "m".into(),
            expected: 1,
            actual: 2
        }
        .is_fatal_for_parent());
        assert!(MigrateError::config("zero threads").is_fatal_for_parent());
        assert!(!MigrateError::not_found("run", "r2").is_fatal_for_parent());
        assert!(!MigrateError::transient("503").is_fatal_for_parent());
    }

    #[test]
    fn test_io_with_path_keeps_path() {
        let err = MigrateError::io_with_path(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/exp/experiment.json",
        );
        match err {
            MigrateError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/exp/experiment.json")))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
