//! Idempotent, roll-at-a-time upload of scan files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scanroute_core::{PipelineError, PipelineResult, RemoteStorage, ResolutionTarget, ScanJob};
use scanroute_telemetry::Metrics;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::RetryPolicy;
use crate::scan_fs::{self, RollFile};

/// Outcome of uploading one roll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollReceipt {
    /// Roll identifier.
    pub roll_id: String,
    /// Remote folder the files were written to.
    pub destination: String,
    /// Files transferred during this pass.
    pub files_sent: usize,
    /// Files already present with matching size (and hash).
    pub files_skipped: usize,
}

/// Remote folder for a roll: `{customer_root}/{order_number}/{roll_id}/photos`.
#[must_use]
pub fn destination_folder(target: &ResolutionTarget, roll_id: &str) -> String {
    format!(
        "{}/{}/{}/photos",
        target.customer_root.trim_end_matches('/'),
        target.order_number.trim_start_matches('#'),
        roll_id
    )
}

/// Transfers roll files to remote storage through a retry policy.
#[derive(Clone)]
pub struct Uploader {
    storage: Arc<dyn RemoteStorage>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Uploader {
    /// Build an uploader.
    #[must_use]
    pub fn new(storage: Arc<dyn RemoteStorage>, retry: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            storage,
            retry,
            metrics,
        }
    }

    /// Upload every file of `roll_id`, skipping files the destination already holds.
    ///
    /// Source files are never modified or removed.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::FilesystemRace`] when the roll or a file vanished.
    /// - [`PipelineError::AttemptsExhausted`] when transient failures hit the ceiling.
    /// - [`PipelineError::Cancelled`] when `cancel` fires; the roll is incomplete.
    pub async fn upload_roll(
        &self,
        job: &ScanJob,
        roll_id: &str,
        target: &ResolutionTarget,
        cancel: &CancellationToken,
    ) -> PipelineResult<RollReceipt> {
        let destination = destination_folder(target, roll_id);
        let files = scan_fs::roll_files(&job.source_path, roll_id, job.roll_kind(roll_id))
            .map_err(|source| PipelineError::FilesystemRace {
                operation: "upload.list_roll",
                path: job.source_path.join(roll_id),
                source,
            })?;

        let mut receipt = RollReceipt {
            roll_id: roll_id.to_string(),
            destination: destination.clone(),
            files_sent: 0,
            files_skipped: 0,
        };
        for file in &files {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    operation: "upload.roll",
                });
            }
            let remote_path = format!("{destination}/{}", file.relative);
            if self.already_present(&remote_path, file, cancel).await? {
                debug!(remote_path = %remote_path, "file already present; skipping");
                self.metrics.inc_file_skipped();
                receipt.files_skipped += 1;
                continue;
            }
            self.retry
                .run_observed(
                    "put_file",
                    cancel,
                    |_, _| self.metrics.inc_upload_retry(),
                    || self.storage.put_file(&remote_path, &file.path),
                )
                .await?;
            self.metrics.inc_file_uploaded();
            receipt.files_sent += 1;
        }

        info!(
            source_path = %job.source_path.display(),
            roll_id,
            destination = %receipt.destination,
            files_sent = receipt.files_sent,
            files_skipped = receipt.files_skipped,
            "roll uploaded"
        );
        Ok(receipt)
    }

    async fn already_present(
        &self,
        remote_path: &str,
        file: &RollFile,
        cancel: &CancellationToken,
    ) -> PipelineResult<bool> {
        let remote = self
            .retry
            .run_observed(
                "exists",
                cancel,
                |_, _| self.metrics.inc_upload_retry(),
                || self.storage.exists(remote_path),
            )
            .await?;
        let Some(remote) = remote else {
            return Ok(false);
        };
        let local_size = tokio::fs::metadata(&file.path)
            .await
            .map_err(|source| race("upload.stat", &file.path, source))?
            .len();
        if remote.size != local_size {
            return Ok(false);
        }
        match remote.content_hash {
            None => Ok(true),
            Some(expected) => {
                let actual = sha256_hex(file.path.clone()).await?;
                Ok(expected.eq_ignore_ascii_case(&actual))
            }
        }
    }
}

fn race(operation: &'static str, path: &Path, source: io::Error) -> PipelineError {
    PipelineError::FilesystemRace {
        operation,
        path: path.to_path_buf(),
        source,
    }
}

/// Lower-case SHA-256 hex digest of a local file.
///
/// # Errors
///
/// Returns [`PipelineError::FilesystemRace`] when the file cannot be read.
pub async fn sha256_hex(path: PathBuf) -> PipelineResult<String> {
    let hashed = tokio::task::spawn_blocking({
        let path = path.clone();
        move || -> io::Result<String> {
            let mut hasher = Sha256::new();
            let mut reader = File::open(&path)?;
            io::copy(&mut reader, &mut hasher)?;
            Ok(format!("{:x}", hasher.finalize()))
        }
    })
    .await
    .map_err(|join_err| race("upload.hash", &path, io::Error::other(join_err)))?;
    hashed.map_err(|source| race("upload.hash", &path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanroute_core::RollKind;
    use scanroute_test_support::{FakeStorage, fixtures};
    use std::error::Error;
    use tempfile::TempDir;

    fn target() -> ResolutionTarget {
        ResolutionTarget {
            order_id: "order-100".into(),
            order_number: "#100".into(),
            customer_email: "jeff@example.com".into(),
            display_name: "Jeff".into(),
            customer_root: "/Store/orders/jeff@example.com/".into(),
            customer_id: None,
        }
    }

    fn uploader(storage: Arc<FakeStorage>, attempts: u32) -> Result<Uploader, Box<dyn Error>> {
        Ok(Uploader::new(
            storage,
            RetryPolicy::immediate(attempts),
            Metrics::new()?,
        ))
    }

    fn laid_out(scan: &Path) -> Result<ScanJob, Box<dyn Error>> {
        let mut job = ScanJob::detected(scan, chrono::Utc::now());
        job.apply_layout(scan_fs::roll_layout(scan)?);
        Ok(job)
    }

    #[test]
    fn destination_is_a_pure_function_of_target_and_roll() {
        let first = destination_folder(&target(), "roll42");
        let second = destination_folder(&target(), "roll42");
        assert_eq!(first, "/Store/orders/jeff@example.com/100/roll42/photos");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn uploads_every_file_once_and_skips_on_rerun() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let scan = fixtures::write_scan(temp.path(), "roll42", 4)?;
        let job = laid_out(&scan)?;
        let storage = Arc::new(FakeStorage::default());
        let uploader = uploader(storage.clone(), 3)?;
        let cancel = CancellationToken::new();

        let first = uploader.upload_roll(&job, "roll42", &target(), &cancel).await?;
        assert_eq!(first.files_sent, 4);
        assert_eq!(storage.put_calls(), 4);

        let second = uploader.upload_roll(&job, "roll42", &target(), &cancel).await?;
        assert_eq!(second.files_sent, 0);
        assert_eq!(second.files_skipped, 4);
        assert_eq!(storage.put_calls(), 4);
        assert_eq!(
            storage.files_under("/Store/orders/jeff@example.com/100/roll42/photos").len(),
            4
        );
        Ok(())
    }

    #[tokio::test]
    async fn loose_files_and_a_same_named_roll_both_upload() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let scan = fixtures::write_scan(temp.path(), "0042", 2)?;
        fixtures::write_roll_scan(temp.path(), "0042", &[("0042", 3)])?;
        let job = laid_out(&scan)?;
        assert_eq!(job.rolls, vec!["0042-loose".to_string(), "0042".to_string()]);
        let storage = Arc::new(FakeStorage::default());
        let uploader = uploader(storage.clone(), 3)?;
        let cancel = CancellationToken::new();

        let mut sent = 0;
        for roll_id in job.pending_rolls() {
            sent += uploader
                .upload_roll(&job, &roll_id, &target(), &cancel)
                .await?
                .files_sent;
        }
        assert_eq!(sent, 5);
        assert_eq!(
            storage
                .files_under(&destination_folder(&target(), "0042-loose"))
                .len(),
            2
        );
        assert_eq!(
            storage.files_under(&destination_folder(&target(), "0042")).len(),
            3
        );
        Ok(())
    }

    #[tokio::test]
    async fn hash_mismatch_forces_resend() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let scan = fixtures::write_scan(temp.path(), "roll9", 1)?;
        let job = laid_out(&scan)?;
        let storage = Arc::new(FakeStorage::with_hashes());
        let uploader = uploader(storage.clone(), 3)?;
        let cancel = CancellationToken::new();
        uploader.upload_roll(&job, "roll9", &target(), &cancel).await?;

        let file = scan_fs::roll_files(&scan, "roll9", RollKind::Loose)?.remove(0);
        let remote = format!("{}/{}", destination_folder(&target(), "roll9"), file.relative);
        storage.corrupt_hash(&remote);

        let rerun = uploader.upload_roll(&job, "roll9", &target(), &cancel).await?;
        assert_eq!(rerun.files_sent, 1);
        assert_eq!(storage.put_calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_surface_and_stop() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let scan = fixtures::write_scan(temp.path(), "flaky", 2)?;
        let job = laid_out(&scan)?;
        let storage = Arc::new(FakeStorage::default());
        storage.fail_puts(u32::MAX);
        let uploader = uploader(storage.clone(), 3)?;

        let result = uploader
            .upload_roll(&job, "flaky", &target(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::AttemptsExhausted { attempts: 3, .. })
        ));
        assert_eq!(storage.put_calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_a_filesystem_race() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let job = ScanJob::detected(temp.path().join("vanished"), chrono::Utc::now());
        let storage = Arc::new(FakeStorage::default());
        let uploader = uploader(storage, 3)?;

        let result = uploader
            .upload_roll(&job, "vanished", &target(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipelineError::FilesystemRace { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_upload_reports_incomplete_roll() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let scan = fixtures::write_scan(temp.path(), "stop", 3)?;
        let job = laid_out(&scan)?;
        let storage = Arc::new(FakeStorage::default());
        let uploader = uploader(storage.clone(), 3)?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = uploader.upload_roll(&job, "stop", &target(), &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled { .. })));
        assert_eq!(storage.put_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sha256_hex_matches_known_digest() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, b"abc")?;
        assert_eq!(
            sha256_hex(path).await?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
