use std::path::PathBuf;
use std::time::Duration;

use color_eyre::eyre::eyre;
use tracing::info;

use watchtally_config::{PathManager, Settings};
use watchtally_core::{EngineOptions, Ledger, NoopSink, Sink, SyncEngine, SyncObserver};
use watchtally_influx::{InfluxOptions, InfluxSink};
use watchtally_sources::trakt::auth;
use watchtally_sources::{TraktClient, TraktClientOptions};

pub struct AppContext {
    pub settings: Settings,
    pub paths: PathManager,
}

pub fn load(config: Option<PathBuf>, require_influx: bool) -> color_eyre::Result<AppContext> {
    let paths = PathManager::default();
    let config_path = config.unwrap_or_else(|| paths.config_file());
    let settings = Settings::load(&config_path, require_influx)?;
    Ok(AppContext { settings, paths })
}

pub fn open_ledger(ctx: &AppContext) -> color_eyre::Result<Ledger> {
    ctx.paths.ensure_directories()?;
    Ok(Ledger::open(&ctx.paths.state_db_file())?)
}

/// Refresh-token precedence: state store, then config seed token, then a
/// config auth code. Anything acquired is persisted so later runs take the
/// first branch. Interactive bootstrap lives in the `auth` command.
pub async fn ensure_refresh_token(
    settings: &Settings,
    ledger: &Ledger,
) -> color_eyre::Result<String> {
    if let Some(token) = ledger.refresh_token()? {
        return Ok(token);
    }
    if let Some(token) = &settings.trakt.refresh_token {
        info!("seeding refresh token from config");
        ledger.set_refresh_token(token)?;
        return Ok(token.clone());
    }
    if let Some(code) = &settings.trakt.auth_code {
        info!("exchanging configured authorization code");
        let token = auth::exchange_auth_code(
            &settings.trakt.client_id,
            &settings.trakt.client_secret,
            code,
        )
        .await?;
        ledger.set_refresh_token(&token)?;
        return Ok(token);
    }
    Err(eyre!(
        "no Trakt authorization found; run `watchtally auth` first"
    ))
}

pub fn build_sink(settings: &Settings, no_influx: bool) -> color_eyre::Result<Box<dyn Sink>> {
    if no_influx {
        info!("running without a sink, events only land in the local state store");
        return Ok(Box::new(NoopSink));
    }
    let influx = settings.influx.as_ref().ok_or_else(|| {
        eyre!("influx settings are missing; configure them or pass --no-influx")
    })?;
    Ok(Box::new(InfluxSink::new(
        reqwest::Client::new(),
        InfluxOptions {
            url: influx.url.trim_end_matches('/').to_string(),
            token: influx.token.clone(),
            org: influx.org.clone(),
            bucket_raw: influx.bucket_raw.clone(),
            bucket_agg: influx.bucket_agg.clone(),
        },
    )))
}

pub async fn build_engine(
    ctx: &AppContext,
    no_influx: bool,
    observer: Box<dyn SyncObserver>,
) -> color_eyre::Result<SyncEngine> {
    let ledger = open_ledger(ctx)?;
    let token = ensure_refresh_token(&ctx.settings, &ledger).await?;

    let source = TraktClient::new(
        ctx.settings.trakt.client_id.clone(),
        ctx.settings.trakt.client_secret.clone(),
        Some(token),
        TraktClientOptions {
            max_retries: ctx.settings.sync.max_retries,
            retry_after_margin: ctx.settings.sync.retry_after_margin,
            min_request_interval: Duration::from_millis(ctx.settings.sync.min_request_interval_ms),
            per_page: ctx.settings.sync.per_page,
        },
    )?;
    let sink = build_sink(&ctx.settings, no_influx)?;
    let options = EngineOptions {
        timezone: ctx.settings.timezone()?,
        overlap_hours: ctx.settings.sync.overlap_hours,
        reconcile_days: ctx.settings.sync.reconcile_days,
    };

    Ok(SyncEngine::new(
        Box::new(source),
        sink,
        ledger,
        observer,
        options,
    ))
}
