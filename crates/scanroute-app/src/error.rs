//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading or validation failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: scanroute_config::ConfigError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: scanroute_telemetry::TelemetryError,
    },
    /// State store operations failed.
    #[error("state store operation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Source store error.
        source: scanroute_store::StoreError,
    },
    /// A pipeline stage or collaborator failed.
    #[error("pipeline operation failed")]
    Pipeline {
        /// Operation identifier.
        operation: &'static str,
        /// Source pipeline error.
        source: scanroute_core::PipelineError,
    },
    /// Filesystem operations outside the state store failed.
    #[error("filesystem operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path being accessed.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// A background task panicked or was aborted.
    #[error("background task failed")]
    Join {
        /// Task name.
        task: &'static str,
        /// Source join error.
        source: tokio::task::JoinError,
    },
    /// Required job state was missing.
    #[error("missing state")]
    MissingState {
        /// Field that was missing.
        field: &'static str,
        /// Scan folder the record belongs to.
        source_path: PathBuf,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: scanroute_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: scanroute_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn store(operation: &'static str, source: scanroute_store::StoreError) -> Self {
        Self::Store { operation, source }
    }

    pub(crate) const fn pipeline(
        operation: &'static str,
        source: scanroute_core::PipelineError,
    ) -> Self {
        Self::Pipeline { operation, source }
    }

    pub(crate) fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the failure came from a shutdown request.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Pipeline {
                source: scanroute_core::PipelineError::Cancelled { .. },
                ..
            }
        )
    }

    /// Whether the error reports a record that moved on or vanished underneath the caller.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::Store {
                source: scanroute_store::StoreError::NotFound { .. }
                    | scanroute_store::StoreError::InvalidTransition { .. },
                ..
            }
        )
    }

    /// Description recorded in `ScanJob::last_error`.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Pipeline { operation, source } => format!("{operation}: {}", source.detail()),
            Self::Store { operation, source } => format!("{self}: {operation}: {source}"),
            Self::Io {
                operation,
                path,
                source,
            } => format!("{operation}: {}: {source}", path.display()),
            Self::MissingState { field, source_path } => {
                format!("{self}: {field} for {}", source_path.display())
            }
            other => other.to_string(),
        }
    }
}
