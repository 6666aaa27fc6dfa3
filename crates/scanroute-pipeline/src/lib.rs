#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Scan pipeline stages below the router.
//!
//! Layout: `scan_fs.rs` (eligibility and roll layout), `detector.rs`
//! (stability debounce and sampling loop), `matcher.rs` (search terms),
//! `retry.rs` (backoff), `uploader.rs` (idempotent roll transfer).

pub mod detector;
pub mod matcher;
pub mod retry;
pub mod scan_fs;
pub mod uploader;

pub use detector::{DetectorEvent, StabilityDetector, StabilitySettings, StabilityTracker, Verdict};
pub use matcher::{MatchOutcome, Matcher, classify};
pub use retry::RetryPolicy;
pub use uploader::{RollReceipt, Uploader, destination_folder, sha256_hex};
