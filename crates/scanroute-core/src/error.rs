//! Error taxonomy shared by the pipeline components and adapters.

use std::io;
use std::path::PathBuf;

use scanroute_events::ScanStage;
use thiserror::Error;

/// Primary error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A remote call failed in a way that may succeed when retried.
    #[error("transient network failure")]
    TransientNetwork {
        /// Operation identifier.
        operation: &'static str,
        /// Collaborator supplied detail.
        detail: String,
    },
    /// A remote collaborator refused the call (auth, outage); not retried.
    #[error("remote service unavailable")]
    RemoteUnavailable {
        /// Operation identifier.
        operation: &'static str,
        /// Collaborator supplied detail.
        detail: String,
    },
    /// No record exists for the requested scan.
    #[error("scan not found")]
    NotFound {
        /// Scan folder that was requested.
        source_path: PathBuf,
    },
    /// The source folder vanished or became unreadable mid-operation.
    #[error("filesystem changed underneath the operation")]
    FilesystemRace {
        /// Operation identifier.
        operation: &'static str,
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: io::Error,
    },
    /// The retry ceiling was reached; wraps the last failure.
    #[error("retry attempts exhausted")]
    AttemptsExhausted {
        /// Operation identifier.
        operation: &'static str,
        /// Attempts performed.
        attempts: u32,
        /// Failure returned by the final attempt.
        #[source]
        last: Box<PipelineError>,
    },
    /// The requested stage change is not allowed by the state machine.
    #[error("invalid stage transition")]
    InvalidTransition {
        /// Scan folder whose stage was being changed.
        source_path: PathBuf,
        /// Stage the record was in.
        from: ScanStage,
        /// Stage that was requested.
        to: ScanStage,
    },
    /// The operation was interrupted by shutdown.
    #[error("operation cancelled")]
    Cancelled {
        /// Operation identifier.
        operation: &'static str,
    },
}

impl PipelineError {
    /// Whether a retry policy should attempt the operation again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// Convenience constructor for transient failures.
    #[must_use]
    pub fn transient(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for unavailable collaborators.
    #[must_use]
    pub fn unavailable(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            operation,
            detail: detail.into(),
        }
    }

    /// Human readable description stored in `ScanJob::last_error`.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::TransientNetwork { operation, detail }
            | Self::RemoteUnavailable { operation, detail } => {
                format!("{self}: {operation}: {detail}")
            }
            Self::NotFound { source_path } => format!("{self}: {}", source_path.display()),
            Self::FilesystemRace {
                operation,
                path,
                source,
            } => format!("{self}: {operation}: {}: {source}", path.display()),
            Self::AttemptsExhausted {
                operation,
                attempts,
                last,
            } => format!("{self}: {operation} after {attempts} attempts: {}", last.detail()),
            Self::InvalidTransition {
                source_path,
                from,
                to,
            } => format!("{self}: {}: {from} -> {to}", source_path.display()),
            Self::Cancelled { operation } => format!("{self}: {operation}"),
        }
    }
}

/// Convenience alias for pipeline results.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(PipelineError::transient("put_file", "timeout").is_retryable());
        assert!(!PipelineError::unavailable("search", "401").is_retryable());
        assert!(
            !PipelineError::Cancelled {
                operation: "upload"
            }
            .is_retryable()
        );
    }

    #[test]
    fn detail_includes_nested_cause() {
        let err = PipelineError::AttemptsExhausted {
            operation: "put_file",
            attempts: 3,
            last: Box::new(PipelineError::transient("put_file", "connection reset")),
        };
        let detail = err.detail();
        assert!(detail.starts_with("retry attempts exhausted"));
        assert!(detail.contains("3 attempts"));
        assert!(detail.contains("connection reset"));
    }

    #[test]
    fn messages_stay_constant() {
        let err = PipelineError::NotFound {
            source_path: PathBuf::from("/scans/missing"),
        };
        assert_eq!(err.to_string(), "scan not found");
    }
}
