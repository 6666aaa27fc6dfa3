//! Scan job domain types shared across the workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use scanroute_events::ScanStage;
use serde::{Deserialize, Serialize};

/// Fingerprint of a scan folder sampled by the stability detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FolderSnapshot {
    /// Number of eligible files below the folder.
    pub file_count: u64,
    /// Sum of the eligible file sizes in bytes.
    pub total_bytes: u64,
    /// Most recent modification time among eligible files.
    pub newest_modified: Option<DateTime<Utc>>,
}

impl FolderSnapshot {
    /// A folder with no eligible files never stabilizes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.file_count == 0
    }
}

/// Where a roll's files live inside its scan folder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollKind {
    /// Files placed directly in the scan folder.
    Loose,
    /// A sub-directory named after the roll.
    Directory,
}

/// Rolls of a scan folder in upload order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollLayout {
    /// Roll identifiers; the loose roll, when present, comes first.
    pub rolls: Vec<String>,
    /// Identifier of the loose-files roll. Never equal to a sub-directory name.
    pub loose_roll: Option<String>,
}

/// Identity a scan is routed to once resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionTarget {
    /// Order identifier understood by the order directory.
    pub order_id: String,
    /// Human facing order number (no leading `#`).
    pub order_number: String,
    /// Customer email address.
    pub customer_email: String,
    /// Display name shown to the operator.
    pub display_name: String,
    /// Customer root folder in remote storage.
    pub customer_root: String,
    /// Customer identifier, used to record a newly created customer root.
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// Shared link created for an uploaded roll folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollLink {
    /// Roll identifier.
    pub roll_id: String,
    /// Remote folder the link points at.
    pub destination: String,
    /// Shareable URL.
    pub url: String,
}

/// One physical scan and its progress through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanJob {
    /// Absolute path to the scan folder; unique key in the state store.
    pub source_path: PathBuf,
    /// Current pipeline stage.
    pub stage: ScanStage,
    /// First time the folder was observed.
    pub detected_at: DateTime<Utc>,
    /// Last time the detector saw the contents change.
    pub last_changed_at: DateTime<Utc>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
    /// Roll identifiers in upload order.
    #[serde(default)]
    pub rolls: Vec<String>,
    /// Identifier of the roll made of loose files, if any.
    #[serde(default)]
    pub loose_roll: Option<String>,
    /// Rolls whose every file has been acknowledged by remote storage.
    #[serde(default)]
    pub completed_rolls: Vec<String>,
    /// Roll identifier to destination folder, filled in once resolved.
    #[serde(default)]
    pub destinations: BTreeMap<String, String>,
    /// Resolution chosen by the operator or supplied by staging reassignment.
    #[serde(default)]
    pub resolution: Option<ResolutionTarget>,
    /// Upload passes performed.
    #[serde(default)]
    pub attempts: u32,
    /// Last failure description.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the job entered the staging queue.
    #[serde(default)]
    pub staged_at: Option<DateTime<Utc>>,
    /// Fingerprint recorded when the folder became stable.
    #[serde(default)]
    pub snapshot: Option<FolderSnapshot>,
    /// Set when the folder changed after resolution or upload had begun.
    #[serde(default)]
    pub changed_after_upload: bool,
    /// Shared links created for uploaded rolls.
    #[serde(default)]
    pub roll_links: Vec<RollLink>,
}

impl ScanJob {
    /// Fresh record for a folder seen for the first time.
    #[must_use]
    pub fn detected(source_path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            source_path: source_path.into(),
            stage: ScanStage::Detected,
            detected_at: now,
            last_changed_at: now,
            updated_at: now,
            rolls: Vec::new(),
            loose_roll: None,
            completed_rolls: Vec::new(),
            destinations: BTreeMap::new(),
            resolution: None,
            attempts: 0,
            last_error: None,
            staged_at: None,
            snapshot: None,
            changed_after_upload: false,
            roll_links: Vec::new(),
        }
    }

    /// Display form of the key.
    #[must_use]
    pub fn path_label(&self) -> String {
        self.source_path.display().to_string()
    }

    /// Folder name, used as the roll id for single-roll scans.
    #[must_use]
    pub fn folder_name(&self) -> String {
        folder_name(&self.source_path)
    }

    /// Replace the roll list with a freshly read layout.
    pub fn apply_layout(&mut self, layout: RollLayout) {
        self.rolls = layout.rolls;
        self.loose_roll = layout.loose_roll;
    }

    /// Where the files of `roll_id` live.
    #[must_use]
    pub fn roll_kind(&self, roll_id: &str) -> RollKind {
        if self.loose_roll.as_deref() == Some(roll_id) {
            RollKind::Loose
        } else {
            RollKind::Directory
        }
    }

    /// Whether the roll has been fully uploaded.
    #[must_use]
    pub fn is_roll_complete(&self, roll_id: &str) -> bool {
        self.completed_rolls.iter().any(|done| done == roll_id)
    }

    /// Rolls still to upload, in order.
    #[must_use]
    pub fn pending_rolls(&self) -> Vec<String> {
        self.rolls
            .iter()
            .filter(|roll| !self.is_roll_complete(roll))
            .cloned()
            .collect()
    }

    /// Record a completed roll once; repeated calls are no-ops.
    pub fn mark_roll_complete(&mut self, roll_id: &str, destination: &str) {
        if !self.is_roll_complete(roll_id) {
            self.completed_rolls.push(roll_id.to_string());
        }
        self.destinations
            .insert(roll_id.to_string(), destination.to_string());
    }
}

/// Final path component of a folder, falling back to the whole path.
#[must_use]
pub fn folder_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// How confident the order directory is in a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    /// Order number or email matched exactly.
    Exact,
    /// Strong partial match.
    Strong,
    /// Loose textual match.
    Weak,
}

/// Candidate order returned by a directory search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    /// Order identifier.
    pub order_id: String,
    /// Human facing order number.
    pub order_number: String,
    /// Label presented to the operator.
    pub label: String,
    /// Customer email address.
    pub customer_email: String,
    /// Customer identifier, when the directory exposes one.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Saved customer root folder, if one was recorded before.
    #[serde(default)]
    pub customer_root: Option<String>,
    /// Directory supplied confidence tier.
    pub confidence: ConfidenceTier,
}

impl Candidate {
    /// Build the resolution target for this candidate with the given customer root.
    #[must_use]
    pub fn into_target(self, customer_root: String) -> ResolutionTarget {
        ResolutionTarget {
            order_id: self.order_id,
            order_number: self.order_number,
            customer_email: self.customer_email,
            display_name: self.label,
            customer_root,
            customer_id: self.customer_id,
        }
    }
}

/// Classification of a search term.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    /// Term contains `@`.
    Email,
    /// Digits with an optional leading `#`.
    OrderNumber,
    /// Anything else.
    FreeText,
}

/// Normalized query handed to the order directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    /// Trimmed, case-folded term; order numbers have the `#` removed.
    pub term: String,
    /// Classification of the term.
    pub kind: TermKind,
}

/// Metadata reported by remote storage for an existing object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Object size in bytes.
    pub size: u64,
    /// Lower-case SHA-256 hex digest, when the store tracks one.
    #[serde(default)]
    pub content_hash: Option<String>,
}
