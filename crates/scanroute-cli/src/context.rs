//! Shared context, error types and exit codes for the CLI.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use scanroute_app::adapters::CatalogOrderDirectory;
use scanroute_config::RouterConfig;
use scanroute_core::PipelineError;
use scanroute_store::{StagingQueue, StateStore, StoreError};

/// CLI-level error type to distinguish validation from operational failures.
#[derive(Debug)]
pub(crate) enum CliError {
    Validation(String),
    Failure(anyhow::Error),
}

/// Convenience alias for functions returning a `CliError`.
pub(crate) type CliResult<T> = Result<T, CliError>;

impl CliError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }

    /// Map a store error, turning the operator-correctable cases into validation errors.
    pub(crate) fn store(operation: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { source_path } => Self::validation(format!(
                "no matching scan record for {}",
                source_path.display()
            )),
            StoreError::InvalidTransition {
                source_path,
                from,
                to,
            } => Self::validation(format!(
                "{} is {from}; it cannot move to {to}",
                source_path.display()
            )),
            other => Self::failure(anyhow::Error::new(other).context(operation.to_string())),
        }
    }

    pub(crate) fn pipeline(operation: &str, err: &PipelineError) -> Self {
        Self::failure(anyhow!("{operation}: {}", err.detail()))
    }

    pub(crate) const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Failure(_) => 3,
        }
    }

    pub(crate) fn display_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Failure(error) => format!("{error:#}"),
        }
    }
}

impl Display for CliError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("cli error")
    }
}

impl std::error::Error for CliError {}

/// Configuration and the state store shared by command handlers.
#[derive(Clone)]
pub(crate) struct CliContext {
    pub(crate) config: RouterConfig,
    pub(crate) store: StateStore,
}

impl CliContext {
    /// Load the watcher's configuration and open its state directory.
    pub(crate) fn load(env_file: Option<&Path>) -> CliResult<Self> {
        let config = match env_file {
            Some(path) => RouterConfig::from_env_file(path),
            None => RouterConfig::from_env(),
        }
        .map_err(|err| CliError::failure(anyhow::Error::new(err).context("loading configuration")))?;
        Self::from_config(config)
    }

    pub(crate) fn from_config(config: RouterConfig) -> CliResult<Self> {
        let store = StateStore::open(&config.state.dir)
            .map_err(|err| CliError::store("opening state directory", err))?;
        Ok(Self { config, store })
    }

    pub(crate) fn staging(&self) -> StagingQueue {
        StagingQueue::new(self.store.clone())
    }

    pub(crate) fn directory(&self) -> CatalogOrderDirectory {
        CatalogOrderDirectory::new(
            self.config.orders.catalog.clone(),
            self.config.orders.lab_name.clone(),
        )
    }
}

/// Records are keyed by the watcher's absolute folder paths.
pub(crate) fn absolute_source(path: &Path) -> CliResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::path::absolute(path).map_err(|err| {
        CliError::failure(anyhow!("failed to resolve '{}': {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanroute_core::ScanStage;

    #[test]
    fn store_errors_split_into_validation_and_failure() {
        let missing = CliError::store(
            "reassign",
            StoreError::NotFound {
                source_path: PathBuf::from("/scans/roll42"),
            },
        );
        assert_eq!(missing.exit_code(), 2);
        assert_eq!(
            missing.display_message(),
            "no matching scan record for /scans/roll42"
        );

        let wrong_stage = CliError::store(
            "retry",
            StoreError::InvalidTransition {
                source_path: PathBuf::from("/scans/roll42"),
                from: ScanStage::Annotated,
                to: ScanStage::Uploading,
            },
        );
        assert_eq!(
            wrong_stage.display_message(),
            "/scans/roll42 is annotated; it cannot move to uploading"
        );

        let io = CliError::store(
            "listing records",
            StoreError::Io {
                operation: "record.read",
                path: PathBuf::from("/state/x.json"),
                source: std::io::Error::other("disk gone"),
            },
        );
        assert_eq!(io.exit_code(), 3);
        assert!(io.display_message().starts_with("listing records: "));
    }

    #[test]
    fn relative_sources_become_absolute() -> Result<(), Box<dyn std::error::Error>> {
        let resolved = absolute_source(Path::new("scans/roll42"))?;
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("scans/roll42"));
        assert_eq!(
            absolute_source(Path::new("/scans/roll42"))?,
            PathBuf::from("/scans/roll42")
        );
        Ok(())
    }
}
