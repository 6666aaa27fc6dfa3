//! Watcher activity written next to the scan records.
//!
//! `events.jsonl` holds one [`EventEnvelope`] per line, rotated to
//! `events.jsonl.1` once it passes [`DEFAULT_ROTATE_BYTES`]. `metrics.prom`
//! holds the Prometheus text exposition and is rewritten after every batch of
//! events. The CLI reads both while the watcher runs.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use scanroute_events::{EventBus, EventEnvelope, EventId, EventStream};
use scanroute_telemetry::Metrics;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

/// Event journal file name inside the state directory.
pub const EVENT_JOURNAL_FILE: &str = "events.jsonl";
/// Metrics exposition file name inside the state directory.
pub const METRICS_FILE: &str = "metrics.prom";
/// Journal size that triggers rotation.
pub const DEFAULT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Path of the event journal for `state_dir`.
#[must_use]
pub fn event_journal_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENT_JOURNAL_FILE)
}

/// Path of the metrics exposition for `state_dir`.
#[must_use]
pub fn metrics_path(state_dir: &Path) -> PathBuf {
    state_dir.join(METRICS_FILE)
}

fn rotated_path(journal: &Path) -> PathBuf {
    let mut name = journal.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Event bus subscriber that persists events and metrics for operators.
pub struct ActivityLog {
    state_dir: PathBuf,
    metrics: Metrics,
    rotate_bytes: u64,
    last_id: EventId,
}

impl ActivityLog {
    /// Log into `state_dir`, rendering `metrics` after each batch.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>, metrics: Metrics) -> Self {
        Self {
            state_dir: state_dir.into(),
            metrics,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            last_id: 0,
        }
    }

    /// Rotate the journal once it reaches `bytes`.
    #[must_use]
    pub const fn with_rotate_bytes(mut self, bytes: u64) -> Self {
        self.rotate_bytes = bytes;
        self
    }

    /// Record events from `stream` until `stop` fires, then record whatever
    /// the bus still buffers and write the final metrics.
    pub async fn run(mut self, bus: EventBus, mut stream: EventStream, stop: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(envelope)) => self.record(&[envelope]).await,
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    debug!(missed, "activity log lagged; reading the replay ring");
                    let backlog = bus.backlog_since(self.last_id);
                    self.record(&backlog).await;
                }
                None => break,
            }
        }
        let backlog = bus.backlog_since(self.last_id);
        self.record(&backlog).await;
        self.write_metrics().await;
        info!(last_event_id = self.last_id, "activity log stopped");
    }

    async fn record(&mut self, envelopes: &[EventEnvelope]) {
        let fresh: Vec<&EventEnvelope> = envelopes
            .iter()
            .filter(|envelope| envelope.id > self.last_id)
            .collect();
        let Some(newest) = fresh.last().map(|envelope| envelope.id) else {
            return;
        };
        if let Err(err) = self.append(&fresh).await {
            warn!(error = %err, detail = %err.detail(), "failed to append to the event journal");
        }
        self.last_id = newest;
        self.write_metrics().await;
    }

    async fn append(&self, envelopes: &[&EventEnvelope]) -> AppResult<()> {
        let journal = event_journal_path(&self.state_dir);
        let mut lines = String::new();
        for envelope in envelopes {
            let line = serde_json::to_string(envelope)
                .map_err(|err| AppError::io("journal.encode", &journal, io::Error::other(err)))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        match tokio::fs::metadata(&journal).await {
            Ok(meta) if meta.len() >= self.rotate_bytes => {
                tokio::fs::rename(&journal, rotated_path(&journal))
                    .await
                    .map_err(|err| AppError::io("journal.rotate", &journal, err))?;
                debug!(journal = %journal.display(), "event journal rotated");
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(AppError::io("journal.stat", &journal, err)),
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal)
            .await
            .map_err(|err| AppError::io("journal.open", &journal, err))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|err| AppError::io("journal.write", &journal, err))?;
        file.flush()
            .await
            .map_err(|err| AppError::io("journal.flush", &journal, err))
    }

    async fn write_metrics(&self) {
        let text = match self.metrics.render() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to render metrics");
                return;
            }
        };
        let state_dir = self.state_dir.clone();
        let written = tokio::task::spawn_blocking(move || write_atomically(&state_dir, &text)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, detail = %err.detail(), "failed to write metrics"),
            Err(err) => warn!(error = %err, "metrics writer task failed"),
        }
    }
}

fn write_atomically(state_dir: &Path, text: &str) -> AppResult<()> {
    let target = metrics_path(state_dir);
    let mut temp = NamedTempFile::new_in(state_dir)
        .map_err(|err| AppError::io("metrics.tempfile", state_dir, err))?;
    temp.write_all(text.as_bytes())
        .map_err(|err| AppError::io("metrics.write", &target, err))?;
    temp.persist(&target)
        .map_err(|err| AppError::io("metrics.persist", &target, err.error))?;
    Ok(())
}

/// The newest `limit` journal entries, oldest first.
///
/// Lines that do not parse (a write cut short by a crash) are skipped.
///
/// # Errors
///
/// Returns [`AppError::Io`] when an existing journal cannot be read.
pub fn read_journal(state_dir: &Path, limit: usize) -> AppResult<Vec<EventEnvelope>> {
    let journal = event_journal_path(state_dir);
    let mut envelopes = Vec::new();
    for path in [rotated_path(&journal), journal] {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(AppError::io("journal.read", &path, err)),
        };
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<EventEnvelope>(line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => debug!(path = %path.display(), error = %err, "skipping journal line"),
            }
        }
    }
    let skip = envelopes.len().saturating_sub(limit);
    Ok(envelopes.split_off(skip))
}

/// The last metrics exposition the watcher wrote, if any.
///
/// # Errors
///
/// Returns [`AppError::Io`] when an existing file cannot be read.
pub fn read_metrics(state_dir: &Path) -> AppResult<Option<String>> {
    let path = metrics_path(state_dir);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::io("metrics.read", &path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanroute_events::Event;
    use std::error::Error;
    use tempfile::TempDir;

    fn detected(path: &str) -> Event {
        Event::ScanDetected {
            source_path: path.into(),
        }
    }

    async fn run_until_stopped(
        log: ActivityLog,
        bus: &EventBus,
        stream: EventStream,
        publish: impl FnOnce(&EventBus) -> Result<(), Box<dyn Error>>,
    ) -> Result<(), Box<dyn Error>> {
        let stop = CancellationToken::new();
        let task = tokio::spawn(log.run(bus.clone(), stream, stop.clone()));
        publish(bus)?;
        stop.cancel();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn journal_and_metrics_follow_the_bus() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let metrics = Metrics::new()?;
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let log = ActivityLog::new(temp.path(), metrics.clone());

        run_until_stopped(log, &bus, stream, |bus| {
            metrics.inc_scan_detected();
            bus.publish(detected("/scans/a"))?;
            bus.publish(Event::HealthChanged {
                degraded: vec!["order_directory".into()],
            })?;
            Ok(())
        })
        .await?;

        let journal = read_journal(temp.path(), 10)?;
        let ids: Vec<EventId> = journal.iter().map(|envelope| envelope.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(journal[1].event.kind(), "health_changed");
        let exposition = read_metrics(temp.path())?.ok_or("metrics file missing")?;
        assert!(exposition.contains("scans_detected_total 1"));
        Ok(())
    }

    #[tokio::test]
    async fn lagging_log_fills_in_from_the_replay_ring() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let bus = EventBus::with_capacity(4);
        let stream = bus.subscribe();
        for idx in 0..6 {
            bus.publish(detected(&format!("/scans/{idx}")))?;
        }
        let stop = CancellationToken::new();
        let log = ActivityLog::new(temp.path(), Metrics::new()?);
        let task = tokio::spawn(log.run(bus.clone(), stream, stop.clone()));

        for _ in 0..200 {
            if read_journal(temp.path(), 10)?.len() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        stop.cancel();
        task.await?;

        let ids: Vec<EventId> = read_journal(temp.path(), 10)?
            .iter()
            .map(|envelope| envelope.id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
        Ok(())
    }

    #[tokio::test]
    async fn journal_rotates_and_reads_across_both_files() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let mut log = ActivityLog::new(temp.path(), Metrics::new()?).with_rotate_bytes(1);
        for id in 1..=3 {
            let envelope = EventEnvelope {
                id,
                timestamp: chrono::Utc::now(),
                event: detected(&format!("/scans/{id}")),
            };
            log.record(&[envelope.clone()]).await;
            log.record(&[envelope]).await;
        }

        assert!(rotated_path(&event_journal_path(temp.path())).exists());
        let ids: Vec<EventId> = read_journal(temp.path(), 2)?
            .iter()
            .map(|envelope| envelope.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(read_journal(temp.path(), 10)?.len(), 2);
        Ok(())
    }

    #[test]
    fn missing_files_read_as_empty_and_torn_lines_are_skipped() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        assert!(read_journal(temp.path(), 5)?.is_empty());
        assert!(read_metrics(temp.path())?.is_none());

        let envelope = EventEnvelope {
            id: 7,
            timestamp: chrono::Utc::now(),
            event: detected("/scans/a"),
        };
        fs::write(
            event_journal_path(temp.path()),
            format!("{}\n{{\"id\":8,\"timest\n", serde_json::to_string(&envelope)?),
        )?;
        assert_eq!(read_journal(temp.path(), 5)?, vec![envelope]);
        Ok(())
    }
}
