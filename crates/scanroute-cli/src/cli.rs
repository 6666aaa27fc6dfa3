//! Argument parsing and command dispatch.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use scanroute_core::ScanStage;
use scanroute_telemetry::{LogFormat, LoggingConfig, init_logging};

use crate::commands::activity::{handle_events, handle_metrics};
use crate::commands::jobs::{handle_retry, handle_show, handle_status};
use crate::commands::staging::{handle_reassign, handle_staged};
use crate::context::{CliContext, CliResult};

/// Parses CLI arguments, executes the requested command and returns the
/// process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let command_name = command_label(&cli.command);

    match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            let message = err.display_message();
            tracing::debug!(command = command_name, error = %message, "command failed");
            eprintln!("error: {message}");
            err.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<()> {
    let ctx = CliContext::load(cli.env_file.as_deref())?;
    let logging = LoggingConfig {
        level: "warn",
        format: LogFormat::from_setting(ctx.config.telemetry.log_format.as_deref()),
        ..LoggingConfig::default()
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("warning: logging disabled: {err}");
    }

    match cli.command {
        Command::Status(args) => handle_status(&ctx, &args, cli.output),
        Command::Show(args) => handle_show(&ctx, &args, cli.output),
        Command::Staged => handle_staged(&ctx, cli.output),
        Command::Reassign(args) => handle_reassign(&ctx, args, cli.output).await,
        Command::Retry(args) => handle_retry(&ctx, &args, cli.output).await,
        Command::Events(args) => handle_events(&ctx, &args, cli.output),
        Command::Metrics => handle_metrics(&ctx),
    }
}

#[derive(Parser)]
#[command(name = "scanroute", about = "Inspect and steer the scan router's state")]
pub(crate) struct Cli {
    #[arg(
        long,
        global = true,
        help = "Read configuration from this .env file instead of the environment"
    )]
    pub(crate) env_file: Option<PathBuf>,
    #[arg(
        long = "output",
        alias = "format",
        global = true,
        value_enum,
        default_value_t = OutputFormat::Table,
        help = "Select output format for commands that render structured data"
    )]
    pub(crate) output: OutputFormat,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// List every scan record.
    Status(StatusArgs),
    /// Show one scan record.
    Show(PathArgs),
    /// List the staging queue, oldest deferral first.
    Staged,
    /// Route a staged scan to an order.
    Reassign(ReassignArgs),
    /// Requeue a failed upload.
    Retry(PathArgs),
    /// Show the watcher's recent pipeline events.
    Events(EventsArgs),
    /// Print the watcher's last metrics snapshot.
    Metrics,
}

#[derive(Args)]
pub(crate) struct StatusArgs {
    #[arg(long, value_parser = parse_stage, help = "Only list scans in this stage")]
    pub(crate) stage: Option<ScanStage>,
}

#[derive(Args)]
pub(crate) struct PathArgs {
    #[arg(help = "Scan folder path")]
    pub(crate) path: PathBuf,
}

#[derive(Args)]
pub(crate) struct ReassignArgs {
    #[arg(help = "Staged scan folder path")]
    pub(crate) path: PathBuf,
    #[arg(long, help = "Email, order number or customer name to search for")]
    pub(crate) order: String,
    #[arg(long, help = "1-based candidate to pick when the search is ambiguous")]
    pub(crate) pick: Option<usize>,
}

#[derive(Args)]
pub(crate) struct EventsArgs {
    #[arg(long, default_value_t = 20, help = "Number of most recent events to show")]
    pub(crate) limit: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    #[default]
    Table,
    Json,
}

const fn command_label(command: &Command) -> &'static str {
    match command {
        Command::Status(_) => "status",
        Command::Show(_) => "show",
        Command::Staged => "staged",
        Command::Reassign(_) => "reassign",
        Command::Retry(_) => "retry",
        Command::Events(_) => "events",
        Command::Metrics => "metrics",
    }
}

fn parse_stage(input: &str) -> Result<ScanStage, String> {
    input.parse::<ScanStage>().map_err(|_| {
        let known: Vec<&str> = ScanStage::ALL.iter().map(|stage| stage.as_str()).collect();
        format!("unknown stage '{input}' (expected one of: {})", known.join(", "))
    })
}
