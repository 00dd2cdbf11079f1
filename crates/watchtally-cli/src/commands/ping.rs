use std::path::PathBuf;

use color_eyre::eyre::eyre;

use crate::commands::setup;
use crate::output::Output;
use watchtally_sources::{TraktClient, TraktClientOptions};

/// Verifies both ends of the pipeline: Trakt authentication (by looking up
/// the account username) and sink reachability.
pub async fn run_ping(
    config: Option<PathBuf>,
    no_influx: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, !no_influx)?;
    let ledger = setup::open_ledger(&ctx)?;
    let token = setup::ensure_refresh_token(&ctx.settings, &ledger).await?;

    let mut failed = false;

    let mut client = TraktClient::new(
        ctx.settings.trakt.client_id.clone(),
        ctx.settings.trakt.client_secret.clone(),
        Some(token),
        TraktClientOptions::default(),
    )?;
    match client.username().await {
        Some(username) => output.success(format!("Trakt: authenticated as {username}")),
        None => {
            output.error("Trakt: could not authenticate");
            failed = true;
        }
    }

    if no_influx {
        output.info("sink: disabled (--no-influx)");
    } else {
        let sink = setup::build_sink(&ctx.settings, false)?;
        match sink.ping().await {
            Ok(()) => output.success("InfluxDB: reachable"),
            Err(error) => {
                output.error(format!("InfluxDB: {error}"));
                failed = true;
            }
        }
    }

    if failed {
        return Err(eyre!("one or more checks failed"));
    }
    Ok(())
}
