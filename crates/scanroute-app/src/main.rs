#![forbid(unsafe_code)]

//! Watcher binary: samples the scanner output folder and routes finished scans.

use scanroute_app::{AppResult, run_app};

/// Boots the scan router and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
