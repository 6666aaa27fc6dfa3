//! Cross-field validation for loaded configuration.

use crate::error::{ConfigError, ConfigResult};
use crate::model::RouterConfig;

impl RouterConfig {
    /// Check invariants the loader cannot express per field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] describing the first violated rule.
    pub fn validate(&self) -> ConfigResult<()> {
        let watch = &self.watch;
        if watch.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("watch", "root", None, "empty"));
        }
        if !watch.root.is_absolute() {
            return Err(ConfigError::invalid(
                "watch",
                "root",
                Some(watch.root.display().to_string()),
                "not_absolute",
            ));
        }
        if !(1..=2).contains(&watch.scan_depth) {
            return Err(ConfigError::invalid(
                "watch",
                "scan_depth",
                Some(watch.scan_depth.to_string()),
                "must_be_1_or_2",
            ));
        }
        if watch.poll_interval.is_zero() {
            return Err(ConfigError::invalid("watch", "poll_interval", Some("0".into()), "zero"));
        }
        if watch.settle.is_zero() {
            return Err(ConfigError::invalid("watch", "settle", Some("0".into()), "zero"));
        }
        if watch.recovery_sweep.is_zero() {
            return Err(ConfigError::invalid("watch", "recovery_sweep", Some("0".into()), "zero"));
        }
        if watch.stable_samples < 2 {
            return Err(ConfigError::invalid(
                "watch",
                "stable_samples",
                Some(watch.stable_samples.to_string()),
                "below_minimum",
            ));
        }
        if watch.settle < watch.poll_interval {
            return Err(ConfigError::invalid(
                "watch",
                "settle",
                Some(format!("{}s", watch.settle.as_secs())),
                "shorter_than_poll_interval",
            ));
        }
        let sampling_span = watch
            .poll_interval
            .saturating_mul(watch.stable_samples - 1);
        if sampling_span > watch.settle {
            return Err(ConfigError::invalid(
                "watch",
                "stable_samples",
                Some(watch.stable_samples.to_string()),
                "outlasts_settle",
            ));
        }
        if self.state.dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("state", "dir", None, "empty"));
        }
        if self.storage.root.trim().is_empty() {
            return Err(ConfigError::invalid("storage", "root", None, "empty"));
        }
        if self.orders.defer_keyword.trim().is_empty() {
            return Err(ConfigError::invalid("orders", "defer_keyword", None, "blank"));
        }
        let upload = &self.upload;
        if upload.max_attempts == 0 {
            return Err(ConfigError::invalid("upload", "max_attempts", Some("0".into()), "zero"));
        }
        if upload.max_parallel == 0 {
            return Err(ConfigError::invalid("upload", "max_parallel", Some("0".into()), "zero"));
        }
        if upload.base_delay > upload.max_delay {
            return Err(ConfigError::invalid(
                "upload",
                "base_delay",
                Some(format!("{}ms", upload.base_delay.as_millis())),
                "exceeds_max_delay",
            ));
        }
        Ok(())
    }
}
