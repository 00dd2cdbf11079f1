use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::eyre;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::commands::setup;
use crate::output::Output;
use watchtally_core::{NoopObserver, SyncEngine};

/// Service mode: a catch-up pass on startup, then cron-scheduled incremental
/// syncs and reconciliation until the process is stopped. An authentication
/// failure at any point clears the stored token and exits non-zero so the
/// supervisor surfaces the re-bootstrap need.
pub async fn run_service(
    config: Option<PathBuf>,
    no_influx: bool,
    no_startup_sync: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, !no_influx)?;
    let timezone = ctx.settings.timezone()?;
    let sync_cron = with_seconds(&ctx.settings.sync.sync_cron);
    let reconcile_cron = with_seconds(&ctx.settings.sync.reconcile_cron);

    let engine = setup::build_engine(&ctx, no_influx, Box::new(NoopObserver)).await?;
    let engine = Arc::new(Mutex::new(engine));
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);

    if !no_startup_sync {
        let mut guard = engine.lock().await;
        let result = if guard.ledger().backfill_completed()? {
            info!("startup catch-up: incremental sync");
            guard.run_incremental().await
        } else {
            info!("startup catch-up: no completed backfill yet, running one");
            guard.run_backfill(false).await
        };
        match result {
            Ok(stats) => output.stats(&stats),
            Err(e) if e.is_authentication() => {
                let _ = guard.ledger().clear_refresh_token();
                drop(guard);
                output.error(
                    "Trakt rejected the stored authorization; it has been cleared. Run `watchtally auth` to re-authorize.",
                );
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| eyre!("could not create scheduler: {e}"))?;

    scheduler
        .add(scheduled_job(
            &sync_cron,
            timezone,
            "incremental",
            engine.clone(),
            fatal_tx.clone(),
        )?)
        .await
        .map_err(|e| eyre!("could not schedule incremental sync: {e}"))?;
    scheduler
        .add(scheduled_job(
            &reconcile_cron,
            timezone,
            "reconcile",
            engine.clone(),
            fatal_tx,
        )?)
        .await
        .map_err(|e| eyre!("could not schedule reconcile: {e}"))?;

    scheduler
        .start()
        .await
        .map_err(|e| eyre!("could not start scheduler: {e}"))?;
    info!(
        sync_cron = %ctx.settings.sync.sync_cron,
        reconcile_cron = %ctx.settings.sync.reconcile_cron,
        timezone = %timezone,
        "scheduler started"
    );
    output.info("service running, press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            scheduler
                .shutdown()
                .await
                .map_err(|e| eyre!("scheduler shutdown failed: {e}"))?;
            Ok(())
        }
        Some(reason) = fatal_rx.recv() => {
            let _ = scheduler.shutdown().await;
            output.error(reason);
            std::process::exit(1);
        }
    }
}

fn scheduled_job(
    cron: &str,
    timezone: chrono_tz::Tz,
    kind: &'static str,
    engine: Arc<Mutex<SyncEngine>>,
    fatal_tx: mpsc::Sender<String>,
) -> color_eyre::Result<Job> {
    Job::new_async_tz(cron, timezone, move |_uuid, _lock| {
        let engine = engine.clone();
        let fatal_tx = fatal_tx.clone();
        Box::pin(async move {
            let mut guard = engine.lock().await;
            let result = match kind {
                "reconcile" => guard.run_reconcile().await,
                _ => guard.run_incremental().await,
            };
            match result {
                Ok(stats) => info!(
                    job = kind,
                    inserted = stats.events_inserted,
                    duplicates = stats.duplicates_skipped,
                    "scheduled job finished"
                ),
                Err(e) if e.is_authentication() => {
                    let _ = guard.ledger().clear_refresh_token();
                    let _ = fatal_tx
                        .send(
                            "Trakt rejected the stored authorization; it has been cleared. Run `watchtally auth` to re-authorize."
                                .to_string(),
                        )
                        .await;
                }
                Err(e) => error!(job = kind, error = %e, "scheduled job failed"),
            }
        })
    })
    .map_err(|e| eyre!("invalid cron expression {cron:?}: {e}"))
}

/// The scheduler wants six-field cron expressions (with seconds); config
/// files use the common five-field form.
fn with_seconds(cron: &str) -> String {
    if cron.split_whitespace().count() == 5 {
        format!("0 {cron}")
    } else {
        cron.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::with_seconds;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(with_seconds("0 6,18 * * *"), "0 0 6,18 * * *");
        assert_eq!(with_seconds("30 3 * * *"), "0 30 3 * * *");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert_eq!(with_seconds("0 30 3 * * *"), "0 30 3 * * *");
    }
}
