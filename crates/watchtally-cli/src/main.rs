use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use watchtally_config::PathManager;

mod commands;
mod logging;
mod output;
mod progress;

#[derive(Parser)]
#[command(name = "watchtally")]
#[command(about = "WatchTally - mirror your Trakt watch history into a time-series store")]
#[command(version)]
struct Cli {
    /// Enable verbose output (use multiple times for more verbosity: -v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Skip the InfluxDB sink; events only land in the local state store
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    no_influx: bool,

    /// Output format
    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a long-lived service with the internal cron scheduler
    #[command(long_about = "Run WatchTally as a long-lived service. Performs a catch-up pass on startup (a backfill if none has completed yet, otherwise an incremental sync), then schedules incremental syncs and nightly reconciliation according to the configured cron expressions.")]
    Run {
        /// Skip the catch-up pass on startup
        #[arg(long, action = ArgAction::SetTrue)]
        no_startup_sync: bool,
    },

    /// Ingest the full watch history (one-time)
    Backfill {
        /// Re-run even if a backfill already completed
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },

    /// Catch up from the stored cursor (one-time)
    Incremental,

    /// Re-fetch the trailing window and mirror remote removals (one-time)
    Reconcile,

    /// Bootstrap Trakt authentication
    #[command(long_about = "Authorize WatchTally against your Trakt account. With --code, exchanges an authorization code directly; otherwise starts the device flow and waits for you to approve the request in a browser.")]
    Auth {
        /// Authorization code (skips the device flow)
        #[arg(long)]
        code: Option<String>,
    },

    /// Check connectivity to Trakt and the configured sink
    Ping,

    /// Drop local sync state (cursor, seen events, dead letters)
    ResetState {
        /// Skip the confirmation prompt
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Service mode logs to a rotating file; one-shot commands log to stderr.
    let log_file = match &cli.command {
        Commands::Run { .. } => {
            let paths = PathManager::default();
            Some(paths.log_dir().join("watchtally.log"))
        }
        _ => None,
    };
    logging::init_logging_with_file(cli.verbose, cli.quiet, log_file)
        .map_err(|e| color_eyre::eyre::eyre!("{}", e))?;

    let output = output::Output::new(cli.output, cli.quiet);

    match cli.command {
        Commands::Run { no_startup_sync } => {
            commands::service::run_service(cli.config, cli.no_influx, no_startup_sync, &output)
                .await
        }
        Commands::Backfill { force } => {
            commands::jobs::run_backfill(cli.config, cli.no_influx, force, &output).await
        }
        Commands::Incremental => {
            commands::jobs::run_incremental(cli.config, cli.no_influx, &output).await
        }
        Commands::Reconcile => {
            commands::jobs::run_reconcile(cli.config, cli.no_influx, &output).await
        }
        Commands::Auth { code } => commands::auth::run_auth(cli.config, code, &output).await,
        Commands::Ping => commands::ping::run_ping(cli.config, cli.no_influx, &output).await,
        Commands::ResetState { yes } => commands::reset::run_reset(cli.config, yes, &output),
    }
}
