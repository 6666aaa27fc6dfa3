//! Stability detection for scan folders.
//!
//! # Design
//! - `StabilityTracker` is a pure debounce over snapshots and timestamps.
//! - `StabilityDetector` samples the watch root and reports to the router
//!   over a channel; it reads the state store but never writes it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use scanroute_core::{FolderSnapshot, RollLayout, ScanJob, ScanStage};
use scanroute_store::StateStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scan_fs;

/// Debounce parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilitySettings {
    /// Sampling interval `P`.
    pub poll_interval: Duration,
    /// Minimum quiet period `D`.
    pub settle: Duration,
    /// Consecutive unchanged samples `K`.
    pub stable_samples: u32,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle: Duration::from_secs(10),
            stable_samples: 3,
        }
    }
}

/// Outcome of feeding one sample to a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Contents differ from the previous sample.
    Changed,
    /// Unchanged, but not yet for long enough.
    Settling,
    /// Unchanged across `K` samples spanning at least `D`.
    Stable,
}

/// Debounce state for one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityTracker {
    last: FolderSnapshot,
    last_sample: DateTime<Utc>,
    changed_at: DateTime<Utc>,
    unchanged_samples: u32,
}

impl StabilityTracker {
    /// Start tracking from a first sample.
    #[must_use]
    pub const fn new(snapshot: FolderSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            last: snapshot,
            last_sample: now,
            changed_at: now,
            unchanged_samples: 1,
        }
    }

    /// When the contents were last seen changing.
    #[must_use]
    pub const fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }

    /// Latest snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> FolderSnapshot {
        self.last
    }

    /// Feed a new sample.
    ///
    /// A change is dated by the newest file modification when that falls
    /// between the previous sample and `now`; otherwise (preserved mtimes,
    /// deletions) by `now`.
    pub fn observe(
        &mut self,
        snapshot: FolderSnapshot,
        now: DateTime<Utc>,
        settings: &StabilitySettings,
    ) -> Verdict {
        if snapshot != self.last {
            let written_at = snapshot
                .newest_modified
                .filter(|modified| *modified > self.last_sample)
                .map_or(now, |modified| modified.min(now));
            *self = Self::new(snapshot, now);
            self.changed_at = written_at;
            return Verdict::Changed;
        }
        self.last_sample = now;
        self.unchanged_samples = self.unchanged_samples.saturating_add(1);
        let quiet = (now - self.changed_at).to_std().unwrap_or(Duration::ZERO);
        if self.unchanged_samples >= settings.stable_samples && quiet >= settings.settle {
            Verdict::Stable
        } else {
            Verdict::Settling
        }
    }
}

/// Signals sent from the detector to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// A non-empty folder with no record was seen.
    Observed {
        /// Scan folder.
        source_path: PathBuf,
        /// Sample time.
        at: DateTime<Utc>,
    },
    /// A freshly detected folder did not settle on its next sample.
    Unsettled {
        /// Scan folder.
        source_path: PathBuf,
        /// Last time the contents changed.
        changed_at: DateTime<Utc>,
    },
    /// The folder settled.
    Stable {
        /// Scan folder.
        source_path: PathBuf,
        /// Settled fingerprint.
        snapshot: FolderSnapshot,
        /// Roll layout at the time of settling.
        layout: RollLayout,
        /// Last time the contents changed.
        changed_at: DateTime<Utc>,
    },
    /// A stable folder changed before resolution began.
    Modified {
        /// Scan folder.
        source_path: PathBuf,
        /// Sample time.
        at: DateTime<Utc>,
    },
    /// The folder changed after resolution or upload had begun.
    ChangedAfterUpload {
        /// Scan folder.
        source_path: PathBuf,
    },
}

impl DetectorEvent {
    /// Scan folder the event refers to.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        match self {
            Self::Observed { source_path, .. }
            | Self::Unsettled { source_path, .. }
            | Self::Stable { source_path, .. }
            | Self::Modified { source_path, .. }
            | Self::ChangedAfterUpload { source_path } => source_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announced {
    Observed,
    Unsettled,
    Stable,
    Modified,
    Flagged,
}

/// Samples the watch root and emits [`DetectorEvent`]s.
pub struct StabilityDetector {
    root: PathBuf,
    depth: usize,
    settings: StabilitySettings,
    store: StateStore,
    trackers: HashMap<PathBuf, StabilityTracker>,
    announced: HashMap<PathBuf, Announced>,
}

impl StabilityDetector {
    /// Build a detector for `root` with scan folders at `depth`.
    ///
    /// A relative root is resolved against the working directory so every
    /// reported `source_path` is absolute.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        depth: usize,
        settings: StabilitySettings,
        store: StateStore,
    ) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root,
            depth,
            settings,
            store,
            trackers: HashMap::new(),
            announced: HashMap::new(),
        }
    }

    /// Take one sample of every scan folder.
    pub fn sample_once(&mut self, now: DateTime<Utc>) -> Vec<DetectorEvent> {
        let folders = match scan_fs::discover_scan_folders(&self.root, self.depth) {
            Ok(folders) => folders,
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "watch root unreadable");
                return Vec::new();
            }
        };

        let present: HashSet<PathBuf> = folders.iter().cloned().collect();
        self.forget_vanished(&present);

        let mut events = Vec::new();
        for folder in folders {
            if let Some(event) = self.sample_folder(&folder, now) {
                events.push(event);
            }
        }
        events
    }

    fn sample_folder(&mut self, folder: &Path, now: DateTime<Utc>) -> Option<DetectorEvent> {
        let snapshot = match scan_fs::snapshot(folder) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.drop_folder(folder, &err.to_string());
                return None;
            }
        };
        let record = match self.store.get(folder) {
            Ok(record) => record,
            Err(err) => {
                warn!(source_path = %folder.display(), error = %err, "state record unreadable");
                return None;
            }
        };

        if let Some(job) = record.as_ref() {
            if job.stage.is_committed() {
                self.trackers.remove(folder);
                return self.flag_if_changed(job, snapshot);
            }
            if job.stage == ScanStage::Stable {
                return self.watch_stable(job, snapshot, now);
            }
        }

        if snapshot.is_empty() {
            self.trackers.remove(folder);
            return None;
        }

        if !self.trackers.contains_key(folder) {
            self.trackers
                .insert(folder.to_path_buf(), StabilityTracker::new(snapshot, now));
            return match record {
                None => self.announce(folder, Announced::Observed).then(|| {
                    info!(source_path = %folder.display(), "scan folder detected");
                    DetectorEvent::Observed {
                        source_path: folder.to_path_buf(),
                        at: now,
                    }
                }),
                Some(_) => None,
            };
        }

        let tracker = self.trackers.get_mut(folder)?;
        let verdict = tracker.observe(snapshot, now, &self.settings);
        let changed_at = tracker.changed_at();
        let Some(job) = record else {
            // The router has not recorded the folder yet.
            return None;
        };
        match verdict {
            Verdict::Stable => {
                let layout = match scan_fs::roll_layout(folder) {
                    Ok(layout) => layout,
                    Err(err) => {
                        self.drop_folder(folder, &err.to_string());
                        return None;
                    }
                };
                self.announce(folder, Announced::Stable).then(|| {
                    info!(
                        source_path = %folder.display(),
                        files = snapshot.file_count,
                        rolls = layout.rolls.len(),
                        "scan folder stable"
                    );
                    DetectorEvent::Stable {
                        source_path: folder.to_path_buf(),
                        snapshot,
                        layout,
                        changed_at,
                    }
                })
            }
            Verdict::Changed | Verdict::Settling if job.stage == ScanStage::Detected => self
                .announce(folder, Announced::Unsettled)
                .then(|| DetectorEvent::Unsettled {
                    source_path: folder.to_path_buf(),
                    changed_at,
                }),
            Verdict::Changed | Verdict::Settling => None,
        }
    }

    fn watch_stable(
        &mut self,
        job: &ScanJob,
        snapshot: FolderSnapshot,
        now: DateTime<Utc>,
    ) -> Option<DetectorEvent> {
        let folder = job.source_path.as_path();
        if job.snapshot.is_none_or(|recorded| recorded == snapshot) {
            self.trackers.remove(folder);
            return None;
        }
        self.trackers
            .entry(folder.to_path_buf())
            .or_insert_with(|| StabilityTracker::new(snapshot, now));
        self.announce(folder, Announced::Modified).then(|| {
            info!(source_path = %folder.display(), "stable scan changed; re-stabilizing");
            DetectorEvent::Modified {
                source_path: folder.to_path_buf(),
                at: now,
            }
        })
    }

    fn flag_if_changed(&mut self, job: &ScanJob, snapshot: FolderSnapshot) -> Option<DetectorEvent> {
        if job.changed_after_upload || job.snapshot.is_none_or(|recorded| recorded == snapshot) {
            return None;
        }
        let folder = job.source_path.as_path();
        self.announce(folder, Announced::Flagged).then(|| {
            warn!(
                source_path = %folder.display(),
                stage = job.stage.as_str(),
                "scan changed after resolution began; flagging for a later pass"
            );
            DetectorEvent::ChangedAfterUpload {
                source_path: folder.to_path_buf(),
            }
        })
    }

    /// Record the announcement; `false` when it was already made.
    fn announce(&mut self, folder: &Path, kind: Announced) -> bool {
        self.announced.insert(folder.to_path_buf(), kind) != Some(kind)
    }

    fn drop_folder(&mut self, folder: &Path, reason: &str) {
        if self.trackers.remove(folder).is_some() {
            warn!(
                source_path = %folder.display(),
                reason,
                "scan folder vanished during stability detection"
            );
        }
        self.announced.remove(folder);
    }

    fn forget_vanished(&mut self, present: &HashSet<PathBuf>) {
        let vanished: Vec<PathBuf> = self
            .trackers
            .keys()
            .chain(self.announced.keys())
            .filter(|path| !present.contains(*path))
            .cloned()
            .collect();
        for folder in vanished {
            self.drop_folder(&folder, "folder no longer listed");
        }
    }

    /// Sample on every poll interval until cancelled or the router hangs up.
    pub async fn run(mut self, events: mpsc::Sender<DetectorEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            root = %self.root.display(),
            depth = self.depth,
            poll_ms = u64::try_from(self.settings.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "stability detector started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for event in self.sample_once(Utc::now()) {
                debug!(source_path = %event.source_path().display(), "detector event");
                if events.send(event).await.is_err() {
                    info!("router stopped; detector exiting");
                    return;
                }
            }
        }
        info!("stability detector stopped");
    }
}
