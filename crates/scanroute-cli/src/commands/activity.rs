//! Read-only views over the activity files the watcher keeps in its state directory.

use anyhow::anyhow;
use scanroute_app::{read_journal, read_metrics};

use crate::cli::{EventsArgs, OutputFormat};
use crate::context::{CliContext, CliError, CliResult};
use crate::output::render_events;

pub(crate) fn handle_events(
    ctx: &CliContext,
    args: &EventsArgs,
    format: OutputFormat,
) -> CliResult<()> {
    let events = read_journal(&ctx.config.state.dir, args.limit)
        .map_err(|err| CliError::failure(anyhow!("reading event journal: {}", err.detail())))?;
    render_events(&events, format)
}

pub(crate) fn handle_metrics(ctx: &CliContext) -> CliResult<()> {
    let text = read_metrics(&ctx.config.state.dir)
        .map_err(|err| CliError::failure(anyhow!("reading metrics: {}", err.detail())))?
        .ok_or_else(|| CliError::validation("no metrics written yet; is the watcher running?"))?;
    print!("{text}");
    Ok(())
}
