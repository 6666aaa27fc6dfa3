//! JSON-per-record state store with per-key serialization.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use scanroute_core::{ScanJob, ScanStage};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

const RECORD_EXTENSION: &str = "json";

/// Durable record of every scan folder ever observed.
///
/// Reads go to disk every time so that records changed by another process
/// (the operator CLI) are seen by the watcher. Read-modify-write cycles are
/// serialized per `source_path`; different keys proceed independently.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StoreInner {
    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a key lock; the map entry is dropped once no other caller shares it.
struct KeyGuard<'a> {
    inner: &'a StoreInner,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.inner.locks();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl StateStore {
    /// Open (creating if needed) the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| StoreError::io("state.open", &dir, err))?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// File backing the record for `source_path`.
    #[must_use]
    pub fn record_path(&self, source_path: &Path) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}.{RECORD_EXTENSION}", record_key(source_path)))
    }

    /// Load the record for a scan folder.
    ///
    /// # Errors
    ///
    /// Returns an error when the record exists but cannot be read or parsed.
    pub fn get(&self, source_path: &Path) -> StoreResult<Option<ScanJob>> {
        read_record(&self.record_path(source_path))
    }

    /// Every record, earliest detected first.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or a record cannot be read.
    pub fn list(&self) -> StoreResult<Vec<ScanJob>> {
        let entries = fs::read_dir(&self.inner.dir)
            .map_err(|err| StoreError::io("state.list", &self.inner.dir, err))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io("state.list", &self.inner.dir, err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(job) = read_record(&path)? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        Ok(jobs)
    }

    /// Records currently in `stage`.
    ///
    /// # Errors
    ///
    /// Propagates [`StateStore::list`] failures.
    pub fn list_stage(&self, stage: ScanStage) -> StoreResult<Vec<ScanJob>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|job| job.stage == stage)
            .collect())
    }

    /// Persist a new record. Returns `false` when the folder is already known.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be written.
    pub async fn create(&self, job: &ScanJob) -> StoreResult<bool> {
        let _guard = self.lock_key(&job.source_path).await;
        let path = self.record_path(&job.source_path);
        if read_record(&path)?.is_some() {
            return Ok(false);
        }
        self.write_record(&path, job)?;
        debug!(source_path = %job.source_path.display(), "scan record created");
        Ok(true)
    }

    /// Apply `mutate` to the stored record under the key lock and persist the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists, any error
    /// returned by `mutate`, or a write failure.
    pub async fn modify<F>(&self, source_path: &Path, mutate: F) -> StoreResult<ScanJob>
    where
        F: FnOnce(&mut ScanJob) -> StoreResult<()> + Send,
    {
        let _guard = self.lock_key(source_path).await;
        let path = self.record_path(source_path);
        let mut job = read_record(&path)?.ok_or_else(|| StoreError::NotFound {
            source_path: source_path.to_path_buf(),
        })?;
        mutate(&mut job)?;
        job.updated_at = Utc::now();
        self.write_record(&path, &job)?;
        Ok(job)
    }

    /// Move the record to `to`, validating the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] when the move is not allowed.
    pub async fn transition(&self, source_path: &Path, to: ScanStage) -> StoreResult<ScanJob> {
        self.transition_with(source_path, to, |_| {}).await
    }

    /// Move the record to `to` and apply `mutate` in the same write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] when the move is not allowed.
    pub async fn transition_with<F>(
        &self,
        source_path: &Path,
        to: ScanStage,
        mutate: F,
    ) -> StoreResult<ScanJob>
    where
        F: FnOnce(&mut ScanJob) + Send,
    {
        let job = self
            .modify(source_path, |job| {
                ensure_transition(job, to)?;
                job.stage = to;
                mutate(job);
                Ok(())
            })
            .await?;
        debug!(
            source_path = %source_path.display(),
            stage = to.as_str(),
            "scan stage changed"
        );
        Ok(job)
    }

    /// Manually requeue a failed upload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] unless the record is `Failed`.
    pub async fn requeue(&self, source_path: &Path) -> StoreResult<ScanJob> {
        self.transition_with(source_path, ScanStage::Uploading, |job| {
            job.last_error = None;
        })
        .await
    }

    async fn lock_key(&self, source_path: &Path) -> KeyGuard<'_> {
        let key = record_key(source_path);
        let lock = Arc::clone(self.inner.locks().entry(key.clone()).or_default());
        KeyGuard {
            inner: &self.inner,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.inner.locks().len()
    }

    fn write_record(&self, path: &Path, job: &ScanJob) -> StoreResult<()> {
        let serialised = serde_json::to_vec_pretty(job)
            .map_err(|err| StoreError::json("record.serialize", path, err))?;
        let mut staged = NamedTempFile::new_in(&self.inner.dir)
            .map_err(|err| StoreError::io("record.tempfile", &self.inner.dir, err))?;
        staged
            .write_all(&serialised)
            .map_err(|err| StoreError::io("record.write", staged.path().to_path_buf(), err))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|err| StoreError::io("record.sync", path, err))?;
        staged
            .persist(path)
            .map_err(|err| StoreError::io("record.persist", path, err.error))?;
        Ok(())
    }
}

fn ensure_transition(job: &ScanJob, to: ScanStage) -> StoreResult<()> {
    if job.stage.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            source_path: job.source_path.clone(),
            from: job.stage,
            to,
        })
    }
}

fn record_key(source_path: &Path) -> String {
    let digest = Sha256::digest(source_path.to_string_lossy().as_bytes());
    format!("{digest:x}")
}

fn read_record(path: &Path) -> StoreResult<Option<ScanJob>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io("record.read", path, err)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| StoreError::json("record.parse", path, err))
}
