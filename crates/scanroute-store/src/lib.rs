#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Durable, crash-recoverable scan state.
//!
//! Each scan folder is one JSON record under the state directory, named by
//! the SHA-256 of its path and replaced atomically on every write. The
//! staging queue is a view over the records in the `Staged` stage.

pub mod error;
pub mod staging;
pub mod state;

pub use error::{StoreError, StoreResult};
pub use staging::StagingQueue;
pub use state::StateStore;
