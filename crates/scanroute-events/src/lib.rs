#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Event bus for the scan routing pipeline.
//!
//! Every pipeline stage publishes typed events with sequential identifiers.
//! Subscribers (the watcher's activity log, tests) read a live stream and
//! fill gaps from the replay ring after lagging. Internally the bus uses `tokio::broadcast` with a bounded
//! buffer; when it overflows, the oldest events are dropped.

pub mod error;
pub mod payloads;
pub mod routing;

pub use error::{EventBusError, EventBusResult};
pub use payloads::{
    DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, ScanStage, UnknownStage,
};
pub use routing::{EventBus, EventStream};
