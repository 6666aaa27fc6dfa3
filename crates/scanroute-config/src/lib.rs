#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Environment-backed configuration for the scan router.
//!
//! Layout: `model.rs` (typed sections), `loader.rs` (environment and `.env`
//! parsing), `validate.rs` (cross-field rules), `defaults.rs` (fallbacks).

mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ENV_PREFIX, read_env_file};
pub use model::{
    OrderConfig, RouterConfig, StateConfig, StorageConfig, TelemetryConfig, UploadConfig,
    WatchConfig,
};
