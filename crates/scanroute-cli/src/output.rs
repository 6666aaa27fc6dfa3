//! Output renderers and formatting helpers for CLI commands.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::anyhow;
use scanroute_core::{Candidate, ConfidenceTier, ScanJob, ScanStage};
use scanroute_events::{Event, EventEnvelope};
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::context::{CliError, CliResult};

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))?;
    println!("{text}");
    Ok(())
}

pub(crate) fn render_jobs(jobs: &[ScanJob], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(jobs)?,
        OutputFormat::Table => print!("{}", format_job_table(jobs)),
    }
    Ok(())
}

pub(crate) fn render_staged(jobs: &[ScanJob], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(jobs)?,
        OutputFormat::Table => print!("{}", format_staged_table(jobs)),
    }
    Ok(())
}

pub(crate) fn render_job(job: &ScanJob, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(job)?,
        OutputFormat::Table => print!("{}", format_job_detail(job)),
    }
    Ok(())
}

pub(crate) fn render_events(events: &[EventEnvelope], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(events)?,
        OutputFormat::Table => print!("{}", format_event_table(events)),
    }
    Ok(())
}

#[must_use]
pub(crate) fn format_event_table(events: &[EventEnvelope]) -> String {
    if events.is_empty() {
        return "no events recorded\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:>6} {:<19} {:<22} DETAIL", "ID", "AT", "KIND");
    for envelope in events {
        let _ = writeln!(
            out,
            "{:>6} {:<19} {:<22} {}",
            envelope.id,
            envelope.timestamp.format("%Y-%m-%d %H:%M:%S"),
            envelope.event.kind(),
            event_detail(&envelope.event)
        );
    }
    out
}

fn event_detail(event: &Event) -> String {
    match event {
        Event::StageChanged { source_path, stage } => format!("{source_path} -> {stage}"),
        Event::RollUploaded {
            source_path,
            roll_id,
            files_sent,
            files_skipped,
            ..
        } => format!("{source_path} roll {roll_id} ({files_sent} sent, {files_skipped} skipped)"),
        Event::UploadFailed {
            source_path,
            message,
        } => format!("{source_path}: {message}"),
        Event::ScanAnnotated {
            source_path,
            order_number,
        } => format!("{source_path} -> #{}", order_number.trim_start_matches('#')),
        Event::HealthChanged { degraded } if degraded.is_empty() => "healthy".to_string(),
        Event::HealthChanged { degraded } => format!("degraded: {}", degraded.join(", ")),
        Event::ScanDetected { source_path }
        | Event::ResolutionRequested { source_path }
        | Event::ScanStaged { source_path }
        | Event::ChangeFlagged { source_path } => source_path.clone(),
    }
}

#[must_use]
pub(crate) fn format_job_table(jobs: &[ScanJob]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:>5} {:>7} {:<8} PATH",
        "STAGE", "TRIES", "ROLLS", "ORDER"
    );
    for job in jobs {
        let _ = writeln!(
            out,
            "{:<20} {:>5} {:>7} {:<8} {}{}",
            job.stage.as_str(),
            job.attempts,
            roll_progress(job),
            order_label(job),
            job.source_path.display(),
            if job.changed_after_upload {
                " (changed after upload)"
            } else {
                ""
            }
        );
        if let Some(error) = &job.last_error {
            let _ = writeln!(out, "{:<20} error: {error}", "");
        }
    }
    let _ = writeln!(out, "{}", stage_summary(jobs));
    out
}

#[must_use]
pub(crate) fn format_staged_table(jobs: &[ScanJob]) -> String {
    if jobs.is_empty() {
        return "staging queue is empty\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<3} {:<20} {:>5} PATH", "#", "STAGED AT", "ROLLS");
    for (index, job) in jobs.iter().enumerate() {
        let staged_at = job
            .staged_at
            .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M").to_string());
        let _ = writeln!(
            out,
            "{:<3} {:<20} {:>5} {}",
            index + 1,
            staged_at,
            job.rolls.len(),
            job.source_path.display()
        );
    }
    out
}

#[must_use]
pub(crate) fn format_job_detail(job: &ScanJob) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "path: {}", job.source_path.display());
    let _ = writeln!(out, "stage: {}", job.stage);
    if let Some(target) = &job.resolution {
        let _ = writeln!(
            out,
            "order: #{} {} <{}>",
            target.order_number.trim_start_matches('#'),
            target.display_name,
            target.customer_email
        );
        let _ = writeln!(out, "customer root: {}", target.customer_root);
    }
    let _ = writeln!(out, "rolls: {}", roll_progress(job));
    for roll in &job.rolls {
        let _ = writeln!(out, "  {roll}");
    }
    if let Some(error) = &job.last_error {
        let _ = writeln!(out, "last error: {error}");
    }
    out
}

#[must_use]
pub(crate) fn format_candidates(candidates: &[Candidate]) -> String {
    let mut out = String::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{}] {} ({})",
            index + 1,
            candidate.label,
            tier_label(candidate.confidence)
        );
    }
    out
}

#[must_use]
pub(crate) const fn tier_label(tier: ConfidenceTier) -> &'static str {
    match tier {
        ConfidenceTier::Exact => "exact",
        ConfidenceTier::Strong => "strong",
        ConfidenceTier::Weak => "weak",
    }
}

fn roll_progress(job: &ScanJob) -> String {
    format!("{}/{}", job.completed_rolls.len(), job.rolls.len())
}

fn order_label(job: &ScanJob) -> String {
    job.resolution.as_ref().map_or_else(
        || "-".to_string(),
        |target| format!("#{}", target.order_number.trim_start_matches('#')),
    )
}

/// `3 scans: 1 staged, 2 annotated`, in pipeline order.
#[must_use]
pub(crate) fn stage_summary(jobs: &[ScanJob]) -> String {
    let mut counts: BTreeMap<usize, (ScanStage, usize)> = BTreeMap::new();
    for job in jobs {
        let rank = ScanStage::ALL
            .iter()
            .position(|stage| *stage == job.stage)
            .unwrap_or(usize::MAX);
        counts.entry(rank).or_insert((job.stage, 0)).1 += 1;
    }
    let noun = if jobs.len() == 1 { "scan" } else { "scans" };
    if counts.is_empty() {
        return format!("0 {noun}");
    }
    let parts: Vec<String> = counts
        .values()
        .map(|(stage, count)| format!("{count} {stage}"))
        .collect();
    format!("{} {noun}: {}", jobs.len(), parts.join(", "))
}
