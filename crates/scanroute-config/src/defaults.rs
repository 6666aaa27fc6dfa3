//! Fallback values applied when a variable is not set.

pub(crate) const SCAN_DEPTH: usize = 1;
pub(crate) const POLL_INTERVAL_SECS: u64 = 2;
pub(crate) const SETTLE_SECS: u64 = 10;
pub(crate) const STABLE_SAMPLES: u32 = 3;
pub(crate) const STATE_DIR: &str = "scanroute-state";
pub(crate) const STORAGE_ROOT: &str = "/Store/orders";
pub(crate) const MIRROR_DIR: &str = "scanroute-mirror";
pub(crate) const ORDER_CATALOG: &str = "orders.json";
pub(crate) const DEFER_KEYWORD: &str = "stage";
pub(crate) const UPLOAD_MAX_ATTEMPTS: u32 = 5;
pub(crate) const UPLOAD_BASE_DELAY_MS: u64 = 1_000;
pub(crate) const UPLOAD_MAX_DELAY_MS: u64 = 30_000;
pub(crate) const MAX_PARALLEL_UPLOADS: usize = 2;
pub(crate) const RECOVERY_SWEEP_SECS: u64 = 30;
pub(crate) const LAB_NAME: &str = "Noritsu";
pub(crate) const LOG_LEVEL: &str = "info";
