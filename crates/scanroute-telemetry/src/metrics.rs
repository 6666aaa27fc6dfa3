//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the scan pipeline reports.

use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the pipeline.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    scans_detected_total: IntCounter,
    stage_transitions_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    files_uploaded_total: IntCounter,
    files_skipped_total: IntCounter,
    upload_retries_total: IntCounter,
    staged_jobs: IntGauge,
    active_uploads: IntGauge,
}

/// Snapshot of selected gauges and counters for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Scan folders recorded for the first time.
    pub scans_detected_total: u64,
    /// Files transferred to remote storage.
    pub files_uploaded_total: u64,
    /// Files skipped because remote storage already held them.
    pub files_skipped_total: u64,
    /// Retries performed by upload retry policies.
    pub upload_retries_total: u64,
    /// Jobs currently waiting in the staging queue.
    pub staged_jobs: i64,
    /// Upload tasks currently running.
    pub active_uploads: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scans_detected_total = counter(
            "scans_detected_total",
            "Scan folders recorded for the first time",
        )?;
        let stage_transitions_total = counter_vec(
            "stage_transitions_total",
            "Scan stage transitions by target stage",
            &["stage"],
        )?;
        let events_emitted_total = counter_vec(
            "events_emitted_total",
            "Pipeline events emitted by type",
            &["type"],
        )?;
        let files_uploaded_total =
            counter("files_uploaded_total", "Files transferred to remote storage")?;
        let files_skipped_total = counter(
            "files_skipped_total",
            "Files already present at the destination",
        )?;
        let upload_retries_total =
            counter("upload_retries_total", "Retried remote storage operations")?;
        let staged_jobs = gauge("staged_jobs", "Jobs waiting in the staging queue")?;
        let active_uploads = gauge("active_uploads", "Upload tasks currently running")?;

        register(&registry, "scans_detected_total", &scans_detected_total)?;
        register(&registry, "stage_transitions_total", &stage_transitions_total)?;
        register(&registry, "events_emitted_total", &events_emitted_total)?;
        register(&registry, "files_uploaded_total", &files_uploaded_total)?;
        register(&registry, "files_skipped_total", &files_skipped_total)?;
        register(&registry, "upload_retries_total", &upload_retries_total)?;
        register(&registry, "staged_jobs", &staged_jobs)?;
        register(&registry, "active_uploads", &active_uploads)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                scans_detected_total,
                stage_transitions_total,
                events_emitted_total,
                files_uploaded_total,
                files_skipped_total,
                upload_retries_total,
                staged_jobs,
                active_uploads,
            }),
        })
    }

    /// Count a newly recorded scan folder.
    pub fn inc_scan_detected(&self) {
        self.inner.scans_detected_total.inc();
    }

    /// Count a stage transition into `stage`.
    pub fn inc_stage_transition(&self, stage: &str) {
        self.inner
            .stage_transitions_total
            .with_label_values(&[stage])
            .inc();
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Count a transferred file.
    pub fn inc_file_uploaded(&self) {
        self.inner.files_uploaded_total.inc();
    }

    /// Count a file skipped because the destination already held it.
    pub fn inc_file_skipped(&self) {
        self.inner.files_skipped_total.inc();
    }

    /// Count a retried remote operation.
    pub fn inc_upload_retry(&self) {
        self.inner.upload_retries_total.inc();
    }

    /// Set the staging queue depth.
    pub fn set_staged_jobs(&self, count: i64) {
        self.inner.staged_jobs.set(count);
    }

    /// Mark an upload task as started.
    pub fn upload_started(&self) {
        self.inner.active_uploads.inc();
    }

    /// Mark an upload task as finished.
    pub fn upload_finished(&self) {
        self.inner.active_uploads.dec();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the pipeline counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans_detected_total: self.inner.scans_detected_total.get(),
            files_uploaded_total: self.inner.files_uploaded_total.get(),
            files_skipped_total: self.inner.files_skipped_total.get(),
            upload_retries_total: self.inner.upload_retries_total.get(),
            staged_jobs: self.inner.staged_jobs.get(),
            active_uploads: self.inner.active_uploads.get(),
        }
    }
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
