//! Errors raised by the state store.

use std::io;
use std::path::PathBuf;

use scanroute_core::ScanStage;
use thiserror::Error;

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced while reading or writing scan records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO failures against the state directory.
    #[error("state store io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// A record could not be serialized or parsed.
    #[error("state store json failure")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Record file involved in the failure.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// No record (or no staged record) exists for the scan folder.
    #[error("scan record not found")]
    NotFound {
        /// Scan folder that was requested.
        source_path: PathBuf,
    },
    /// The requested stage change is not allowed.
    #[error("invalid stage transition")]
    InvalidTransition {
        /// Scan folder whose stage was being changed.
        source_path: PathBuf,
        /// Stage the record was in.
        from: ScanStage,
        /// Stage that was requested.
        to: ScanStage,
    },
}

impl StoreError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether the error reports a missing record.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
