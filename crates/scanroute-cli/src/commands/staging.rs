use std::sync::Arc;

use scanroute_core::{Candidate, ScanStage};
use scanroute_pipeline::{MatchOutcome, Matcher};
use tracing::info;

use crate::cli::{OutputFormat, ReassignArgs};
use crate::context::{CliContext, CliError, CliResult, absolute_source};
use crate::output::{format_candidates, render_job, render_staged};

pub(crate) fn handle_staged(ctx: &CliContext, format: OutputFormat) -> CliResult<()> {
    let staged = ctx
        .staging()
        .list()
        .map_err(|err| CliError::store("listing staged scans", err))?;
    render_staged(&staged, format)
}

/// Search the order directory and hand the staged scan back to the watcher
/// with the chosen target. Safe to run while the watcher is live: the store
/// serializes the update and the next sweep starts the upload.
pub(crate) async fn handle_reassign(
    ctx: &CliContext,
    args: ReassignArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let source_path = absolute_source(&args.path)?;
    let job = ctx
        .store
        .get(&source_path)
        .map_err(|err| CliError::store("reading scan record", err))?
        .ok_or_else(|| {
            CliError::validation(format!(
                "no matching scan record for {}",
                source_path.display()
            ))
        })?;
    if job.stage != ScanStage::Staged {
        return Err(CliError::validation(format!(
            "{} is {}, not staged",
            source_path.display(),
            job.stage
        )));
    }

    let matcher = Matcher::new(
        Arc::new(ctx.directory()),
        &ctx.config.orders.defer_keyword,
    );
    let candidates = match matcher
        .search(&args.order)
        .await
        .map_err(|err| CliError::pipeline("order search", &err))?
    {
        MatchOutcome::Deferred => {
            return Err(CliError::validation(
                "the defer keyword cannot be used to reassign a staged scan",
            ));
        }
        MatchOutcome::Candidates(candidates) => candidates,
    };
    let candidate = choose_candidate(candidates, &args.order, args.pick)?;

    let root = candidate.customer_root.clone().unwrap_or_else(|| {
        format!(
            "{}/{}",
            ctx.config.storage.root.trim_end_matches('/'),
            candidate.customer_email
        )
    });
    let target = candidate.into_target(root);
    let resolved = ctx
        .staging()
        .resolve(&source_path, target)
        .await
        .map_err(|err| CliError::store("reassigning staged scan", err))?;
    info!(
        source_path = %resolved.source_path.display(),
        "staged scan reassigned from the CLI"
    );

    if format == OutputFormat::Table {
        if let Some(target) = &resolved.resolution {
            println!(
                "{} routed to order #{} ({}); the watcher uploads it on its next sweep",
                resolved.source_path.display(),
                target.order_number.trim_start_matches('#'),
                target.customer_email
            );
        }
        Ok(())
    } else {
        render_job(&resolved, format)
    }
}

/// Pick one candidate: the only match, or the 1-based `pick`.
pub(crate) fn choose_candidate(
    candidates: Vec<Candidate>,
    term: &str,
    pick: Option<usize>,
) -> CliResult<Candidate> {
    if candidates.is_empty() {
        return Err(CliError::validation(format!(
            "no orders matched \"{}\"",
            term.trim()
        )));
    }
    let count = candidates.len();
    let index = match pick {
        Some(number) if (1..=count).contains(&number) => number - 1,
        Some(number) => {
            return Err(CliError::validation(format!(
                "--pick {number} is out of range; {count} orders matched:\n{}",
                format_candidates(&candidates)
            )));
        }
        None if count == 1 => 0,
        None => {
            return Err(CliError::validation(format!(
                "{count} orders matched \"{}\"; rerun with --pick <n>:\n{}",
                term.trim(),
                format_candidates(&candidates)
            )));
        }
    };
    candidates
        .into_iter()
        .nth(index)
        .ok_or_else(|| CliError::validation("candidate disappeared"))
}
