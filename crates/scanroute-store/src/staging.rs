//! Staging queue: scans the operator deferred for later manual resolution.

use std::path::Path;

use chrono::Utc;
use scanroute_core::{ResolutionTarget, ScanJob, ScanStage};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::state::StateStore;

/// Ordered view over the `Staged` records of a [`StateStore`].
#[derive(Clone)]
pub struct StagingQueue {
    store: StateStore,
}

impl StagingQueue {
    /// Wrap a state store.
    #[must_use]
    pub const fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Defer a job awaiting resolution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] unless the job is awaiting resolution.
    pub async fn enqueue(&self, job: &ScanJob) -> StoreResult<ScanJob> {
        let staged = self
            .store
            .transition_with(&job.source_path, ScanStage::Staged, |record| {
                record.staged_at = Some(Utc::now());
                record.resolution = None;
            })
            .await?;
        info!(source_path = %staged.source_path.display(), "scan staged for later resolution");
        Ok(staged)
    }

    /// Staged jobs, oldest deferral first.
    ///
    /// # Errors
    ///
    /// Propagates state store read failures.
    pub fn list(&self) -> StoreResult<Vec<ScanJob>> {
        let mut staged = self.store.list_stage(ScanStage::Staged)?;
        staged.sort_by(|a, b| {
            a.staged_at
                .cmp(&b.staged_at)
                .then_with(|| a.detected_at.cmp(&b.detected_at))
        });
        Ok(staged)
    }

    /// Supply a target for a staged job, returning it to the pipeline at
    /// `AwaitingResolution`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the path is unknown or not staged.
    pub async fn resolve(
        &self,
        source_path: &Path,
        target: ResolutionTarget,
    ) -> StoreResult<ScanJob> {
        let resolved = self
            .store
            .modify(source_path, |job| {
                if job.stage != ScanStage::Staged {
                    return Err(StoreError::NotFound {
                        source_path: source_path.to_path_buf(),
                    });
                }
                job.stage = ScanStage::AwaitingResolution;
                job.staged_at = None;
                job.destinations.clear();
                job.resolution = Some(target);
                Ok(())
            })
            .await?;
        info!(
            source_path = %resolved.source_path.display(),
            "staged scan reassigned"
        );
        Ok(resolved)
    }
}
