#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Scan router application wiring.
//!
//! Layout: `bootstrap.rs` (dependency wiring and run loop), `orchestrator.rs`
//! (the router state machine), `activity.rs` (event journal and metrics
//! file), `adapters/` (bundled collaborators).

pub mod activity;
pub mod adapters;
/// Watcher bootstrap and environment loading.
pub mod bootstrap;
pub mod error;
pub mod orchestrator;

pub use activity::{ActivityLog, read_journal, read_metrics};
pub use bootstrap::{BootstrapDependencies, run_app, run_app_with};
pub use error::{AppError, AppResult};
pub use orchestrator::{Router, RouterParts, RouterSettings};
