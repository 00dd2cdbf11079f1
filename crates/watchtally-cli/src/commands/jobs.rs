use std::path::PathBuf;

use tracing::warn;

use crate::commands::setup;
use crate::output::Output;
use crate::progress::ProgressObserver;
use watchtally_core::{EngineError, SyncEngine, SyncStats};

pub async fn run_backfill(
    config: Option<PathBuf>,
    no_influx: bool,
    force: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, !no_influx)?;
    let mut engine = setup::build_engine(&ctx, no_influx, Box::new(ProgressObserver::new())).await?;
    let result = engine.run_backfill(force).await;
    finish(result, &engine, output)
}

pub async fn run_incremental(
    config: Option<PathBuf>,
    no_influx: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, !no_influx)?;
    let mut engine = setup::build_engine(&ctx, no_influx, Box::new(ProgressObserver::new())).await?;
    let result = engine.run_incremental().await;
    finish(result, &engine, output)
}

pub async fn run_reconcile(
    config: Option<PathBuf>,
    no_influx: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, !no_influx)?;
    let mut engine = setup::build_engine(&ctx, no_influx, Box::new(ProgressObserver::new())).await?;
    let result = engine.run_reconcile().await;
    finish(result, &engine, output)
}

/// Auth failures terminate the process: the stored authorization is cleared
/// so the next run re-bootstraps instead of failing the same way forever.
fn finish(
    result: Result<SyncStats, EngineError>,
    engine: &SyncEngine,
    output: &Output,
) -> color_eyre::Result<()> {
    match result {
        Ok(stats) => {
            output.stats(&stats);
            Ok(())
        }
        Err(error) if error.is_authentication() => {
            if let Err(e) = engine.ledger().clear_refresh_token() {
                warn!(error = %e, "could not clear stored refresh token");
            }
            output.error(
                "Trakt rejected the stored authorization; it has been cleared. Run `watchtally auth` to re-authorize.",
            );
            std::process::exit(1);
        }
        Err(error) => Err(error.into()),
    }
}
