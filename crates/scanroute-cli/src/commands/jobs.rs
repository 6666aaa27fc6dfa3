use scanroute_core::ScanJob;
use tracing::info;

use crate::cli::{OutputFormat, PathArgs, StatusArgs};
use crate::context::{CliContext, CliError, CliResult, absolute_source};
use crate::output::{render_job, render_jobs};

pub(crate) fn handle_status(
    ctx: &CliContext,
    args: &StatusArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let jobs = match args.stage {
        Some(stage) => ctx.store.list_stage(stage),
        None => ctx.store.list(),
    }
    .map_err(|err| CliError::store("listing scan records", err))?;
    render_jobs(&jobs, format)
}

pub(crate) fn handle_show(ctx: &CliContext, args: &PathArgs, format: OutputFormat) -> CliResult<()> {
    let job = load_job(ctx, args)?;
    render_job(&job, format)
}

/// Move a `Failed` record back to `Uploading`; the watcher resumes it on its
/// next sweep, skipping rolls that already completed.
pub(crate) async fn handle_retry(
    ctx: &CliContext,
    args: &PathArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let source_path = absolute_source(&args.path)?;
    let job = ctx
        .store
        .requeue(&source_path)
        .await
        .map_err(|err| CliError::store("requeueing upload", err))?;
    info!(source_path = %job.source_path.display(), "failed upload requeued");
    if format == OutputFormat::Table {
        println!(
            "requeued {} ({} of {} rolls already uploaded)",
            job.source_path.display(),
            job.completed_rolls.len(),
            job.rolls.len()
        );
        Ok(())
    } else {
        render_job(&job, format)
    }
}

fn load_job(ctx: &CliContext, args: &PathArgs) -> CliResult<ScanJob> {
    let source_path = absolute_source(&args.path)?;
    ctx.store
        .get(&source_path)
        .map_err(|err| CliError::store("reading scan record", err))?
        .ok_or_else(|| {
            CliError::validation(format!(
                "no matching scan record for {}",
                source_path.display()
            ))
        })
}
