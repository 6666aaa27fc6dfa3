//! Event payload types carried through the scan pipeline.

use chrono::{DateTime, Utc};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Identifier assigned to each event emitted by the pipeline.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced across the pipeline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A scan folder was seen for the first time.
    ScanDetected {
        /// Absolute path to the scan folder.
        source_path: String,
    },
    /// A scan moved to a new pipeline stage.
    StageChanged {
        /// Absolute path to the scan folder.
        source_path: String,
        /// Stage the scan entered.
        stage: ScanStage,
    },
    /// A stable scan was queued for operator resolution.
    ResolutionRequested {
        /// Absolute path to the scan folder.
        source_path: String,
    },
    /// The operator deferred the scan to the staging queue.
    ScanStaged {
        /// Absolute path to the scan folder.
        source_path: String,
    },
    /// Every file of a roll was acknowledged by remote storage.
    RollUploaded {
        /// Absolute path to the scan folder.
        source_path: String,
        /// Roll identifier.
        roll_id: String,
        /// Remote folder the roll was written to.
        destination: String,
        /// Files transferred during this pass.
        files_sent: usize,
        /// Files already present remotely.
        files_skipped: usize,
    },
    /// An upload pass failed.
    UploadFailed {
        /// Absolute path to the scan folder.
        source_path: String,
        /// Failure description recorded on the job.
        message: String,
    },
    /// The order record was annotated with the roll links.
    ScanAnnotated {
        /// Absolute path to the scan folder.
        source_path: String,
        /// Order number the scan was routed to.
        order_number: String,
    },
    /// The folder changed after resolution or upload had begun.
    ChangeFlagged {
        /// Absolute path to the scan folder.
        source_path: String,
    },
    /// Aggregated health state changed.
    HealthChanged {
        /// Components currently degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for log and status consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ScanDetected { .. } => "scan_detected",
            Self::StageChanged { .. } => "stage_changed",
            Self::ResolutionRequested { .. } => "resolution_requested",
            Self::ScanStaged { .. } => "scan_staged",
            Self::RollUploaded { .. } => "roll_uploaded",
            Self::UploadFailed { .. } => "upload_failed",
            Self::ScanAnnotated { .. } => "scan_annotated",
            Self::ChangeFlagged { .. } => "change_flagged",
            Self::HealthChanged { .. } => "health_changed",
        }
    }

    /// Scan folder the event refers to, if any.
    #[must_use]
    pub fn source_path(&self) -> Option<&str> {
        match self {
            Self::ScanDetected { source_path }
            | Self::StageChanged { source_path, .. }
            | Self::ResolutionRequested { source_path }
            | Self::ScanStaged { source_path }
            | Self::RollUploaded { source_path, .. }
            | Self::UploadFailed { source_path, .. }
            | Self::ScanAnnotated { source_path, .. }
            | Self::ChangeFlagged { source_path } => Some(source_path),
            Self::HealthChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Pipeline stages a scan moves through.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    /// Folder observed for the first time.
    Detected,
    /// Contents are still changing.
    Stabilizing,
    /// Contents settled; waiting to be dispatched for resolution.
    Stable,
    /// Waiting for an operator to pick the order.
    AwaitingResolution,
    /// Deferred to the staging queue.
    Staged,
    /// Files are being transferred.
    Uploading,
    /// Every roll was transferred.
    Uploaded,
    /// The order record carries the roll links.
    Annotated,
    /// Upload attempts were exhausted or the source vanished.
    Failed,
}

impl ScanStage {
    /// Every stage in pipeline order.
    pub const ALL: [Self; 9] = [
        Self::Detected,
        Self::Stabilizing,
        Self::Stable,
        Self::AwaitingResolution,
        Self::Staged,
        Self::Uploading,
        Self::Uploaded,
        Self::Annotated,
        Self::Failed,
    ];

    /// Stable snake-case label used in records, logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Stabilizing => "stabilizing",
            Self::Stable => "stable",
            Self::AwaitingResolution => "awaiting_resolution",
            Self::Staged => "staged",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Annotated => "annotated",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Detected, Self::Stabilizing | Self::Stable)
                | (Self::Stabilizing, Self::Stable)
                | (Self::Stable, Self::Stabilizing | Self::AwaitingResolution)
                | (Self::AwaitingResolution, Self::Staged | Self::Uploading)
                | (Self::Staged, Self::AwaitingResolution)
                | (Self::Uploading, Self::Uploaded | Self::Failed)
                | (Self::Failed, Self::Uploading)
                | (Self::Uploaded, Self::Annotated)
        )
    }

    /// Whether the detector has already handed the scan off.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Detected | Self::Stabilizing)
    }

    /// Whether resolution or upload has begun, after which folder changes are only flagged.
    #[must_use]
    pub const fn is_committed(self) -> bool {
        !matches!(self, Self::Detected | Self::Stabilizing | Self::Stable)
    }
}

impl Display for ScanStage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStage(pub String);

impl Display for UnknownStage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("unknown scan stage")
    }
}

impl std::error::Error for UnknownStage {}

impl FromStr for ScanStage {
    type Err = UnknownStage;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| UnknownStage(value.to_string()))
    }
}
