//! Span context helpers for the watcher and per-scan tasks.

use std::future::Future;
use std::sync::Arc;

use tracing::{Span, span::Entered};

use crate::init::build_sha;

/// Guard that keeps the application-level span entered for the lifetime of the process.
pub struct GlobalContextGuard {
    _guard: Entered<'static>,
}

impl GlobalContextGuard {
    #[must_use]
    /// Enter the application-level tracing span for the lifetime of the guard.
    pub fn new(mode: impl Into<String>) -> Self {
        let mode = mode.into();
        let span: &'static Span = Box::leak(Box::new(
            tracing::info_span!("app", mode = %mode, build_sha = %build_sha()),
        ));
        let guard = span.enter();
        Self { _guard: guard }
    }
}

/// Record the current application mode on the active span.
pub fn record_app_mode(mode: &str) {
    Span::current().record("mode", tracing::field::display(mode));
}

/// Scan folder handled by the current task, if one is set.
#[must_use]
pub fn current_scan() -> Option<String> {
    ACTIVE_SCAN
        .try_with(|scan| scan.as_ref().to_string())
        .ok()
}

/// Execute the future with `source_path` available to [`current_scan`].
pub async fn with_scan_context<Fut, T>(source_path: impl Into<String>, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let scan: Arc<str> = Arc::from(source_path.into());
    ACTIVE_SCAN.scope(scan, fut).await
}

tokio::task_local! {
    static ACTIVE_SCAN: Arc<str>;
}
