//! Typed configuration sections.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Complete router configuration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RouterConfig {
    /// Scanner output watching and stability detection.
    pub watch: WatchConfig,
    /// Durable state location.
    pub state: StateConfig,
    /// Remote storage layout and local mirror.
    pub storage: StorageConfig,
    /// Order directory and operator conversation settings.
    pub orders: OrderConfig,
    /// Upload retry and parallelism.
    pub upload: UploadConfig,
    /// Logging settings.
    pub telemetry: TelemetryConfig,
}

/// Scanner output watching and stability detection.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WatchConfig {
    /// Directory the scanner writes into.
    pub root: PathBuf,
    /// Depth of scan folders below the root (1 or 2).
    pub scan_depth: usize,
    /// Sampling interval `P`.
    pub poll_interval: Duration,
    /// Minimum quiet period `D` before a scan counts as stable.
    pub settle: Duration,
    /// Consecutive unchanged samples `K` required.
    pub stable_samples: u32,
    /// How often the router re-derives work from the state store.
    pub recovery_sweep: Duration,
}

/// Durable state location.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding one JSON record per scan folder.
    pub dir: PathBuf,
}

/// Remote storage layout.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Remote folder under which customer roots are created.
    pub root: String,
    /// Local directory mirroring the remote layout.
    pub mirror_dir: PathBuf,
}

/// Order directory and operator conversation settings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OrderConfig {
    /// JSON catalog of orders served by the bundled directory adapter.
    pub catalog: PathBuf,
    /// Search term that defers a scan to the staging queue.
    pub defer_keyword: String,
    /// Tag annotated orders for downstream automation.
    pub auto_tag: bool,
    /// Lab name written into order notes.
    pub lab_name: String,
}

/// Upload retry and parallelism.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadConfig {
    /// Attempts per remote operation before giving up.
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Jobs uploading at the same time.
    pub max_parallel: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Default level when `RUST_LOG` is unset.
    pub log_level: String,
    /// `json` or `pretty`; inferred from the build when unset.
    pub log_format: Option<String>,
}
