//! Environment and `.env` loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::defaults;
use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    OrderConfig, RouterConfig, StateConfig, StorageConfig, TelemetryConfig, UploadConfig,
    WatchConfig,
};

/// Prefix shared by every variable the router reads.
pub const ENV_PREFIX: &str = "SCANROUTE_";

impl RouterConfig {
    /// Load from the process environment, seeding it from `.env` when present.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is missing, malformed, or fails validation.
    pub fn from_env() -> ConfigResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env file"),
            Err(err) if err.not_found() => {}
            Err(err) => warn!(error = %err, "ignoring unreadable .env file"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a specific `.env` file without touching the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or the values are invalid.
    pub fn from_env_file(path: &Path) -> ConfigResult<Self> {
        let vars = read_env_file(path)?;
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is missing, malformed, or fails validation.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self {
            watch: WatchConfig {
                root: env.required_path("watch", "SCANROUTE_WATCH_ROOT")?,
                scan_depth: env.parse("watch", "SCANROUTE_SCAN_DEPTH", defaults::SCAN_DEPTH)?,
                poll_interval: env.secs(
                    "watch",
                    "SCANROUTE_POLL_INTERVAL_SECS",
                    defaults::POLL_INTERVAL_SECS,
                )?,
                settle: env.secs("watch", "SCANROUTE_SETTLE_SECS", defaults::SETTLE_SECS)?,
                stable_samples: env.parse(
                    "watch",
                    "SCANROUTE_STABLE_SAMPLES",
                    defaults::STABLE_SAMPLES,
                )?,
                recovery_sweep: env.secs(
                    "watch",
                    "SCANROUTE_RECOVERY_SWEEP_SECS",
                    defaults::RECOVERY_SWEEP_SECS,
                )?,
            },
            state: StateConfig {
                dir: env.path("SCANROUTE_STATE_DIR", defaults::STATE_DIR),
            },
            storage: StorageConfig {
                root: env.string("SCANROUTE_STORAGE_ROOT", defaults::STORAGE_ROOT),
                mirror_dir: env.path("SCANROUTE_MIRROR_DIR", defaults::MIRROR_DIR),
            },
            orders: OrderConfig {
                catalog: env.path("SCANROUTE_ORDER_CATALOG", defaults::ORDER_CATALOG),
                defer_keyword: env.string("SCANROUTE_DEFER_KEYWORD", defaults::DEFER_KEYWORD),
                auto_tag: env.flag("orders", "SCANROUTE_AUTO_TAG", false)?,
                lab_name: env.string("SCANROUTE_LAB_NAME", defaults::LAB_NAME),
            },
            upload: UploadConfig {
                max_attempts: env.parse(
                    "upload",
                    "SCANROUTE_UPLOAD_MAX_ATTEMPTS",
                    defaults::UPLOAD_MAX_ATTEMPTS,
                )?,
                base_delay: env.millis(
                    "upload",
                    "SCANROUTE_UPLOAD_BASE_DELAY_MS",
                    defaults::UPLOAD_BASE_DELAY_MS,
                )?,
                max_delay: env.millis(
                    "upload",
                    "SCANROUTE_UPLOAD_MAX_DELAY_MS",
                    defaults::UPLOAD_MAX_DELAY_MS,
                )?,
                max_parallel: env.parse(
                    "upload",
                    "SCANROUTE_MAX_PARALLEL_UPLOADS",
                    defaults::MAX_PARALLEL_UPLOADS,
                )?,
            },
            telemetry: TelemetryConfig {
                log_level: env.string("SCANROUTE_LOG_LEVEL", defaults::LOG_LEVEL),
                log_format: env.optional("SCANROUTE_LOG_FORMAT"),
            },
        };
        config.watch.root = absolute_watch_root(config.watch.root)?;
        config.validate()?;
        Ok(config)
    }
}

/// Scan records are keyed by absolute folder path, so a relative watch root
/// is anchored at the working directory once, at load time.
fn absolute_watch_root(root: PathBuf) -> ConfigResult<PathBuf> {
    if root.as_os_str().is_empty() || root.is_absolute() {
        return Ok(root);
    }
    std::path::absolute(&root).map_err(|_| {
        ConfigError::invalid(
            "watch",
            "root",
            Some(root.display().to_string()),
            "not_absolute",
        )
    })
}

/// Read a `.env` file into a map without modifying the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::EnvFile`] when the file cannot be read or a line cannot be parsed.
pub fn read_env_file(path: &Path) -> ConfigResult<HashMap<String, String>> {
    let to_error = |source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    let mut vars = HashMap::new();
    for item in dotenvy::from_path_iter(path).map_err(to_error)? {
        let (key, value) = item.map_err(to_error)?;
        vars.insert(key, value);
    }
    Ok(vars)
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.string(key, default))
    }

    fn required_path(&self, section: &'static str, key: &'static str) -> ConfigResult<PathBuf> {
        self.optional(key)
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingField {
                section,
                field: key,
            })
    }

    fn parse<T: FromStr>(&self, section: &'static str, key: &'static str, default: T) -> ConfigResult<T> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::invalid(section, key, Some(raw), "not_a_number")),
        }
    }

    fn secs(&self, section: &'static str, key: &'static str, default: u64) -> ConfigResult<Duration> {
        self.parse(section, key, default).map(Duration::from_secs)
    }

    fn millis(
        &self,
        section: &'static str,
        key: &'static str,
        default: u64,
    ) -> ConfigResult<Duration> {
        self.parse(section, key, default).map(Duration::from_millis)
    }

    fn flag(&self, section: &'static str, key: &'static str, default: bool) -> ConfigResult<bool> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(section, key, Some(raw), "not_a_boolean")),
            },
        }
    }
}
