use std::io::IsTerminal;
use std::path::PathBuf;

use color_eyre::eyre::eyre;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use crate::commands::setup;
use crate::output::Output;
use watchtally_sources::trakt::auth;
use watchtally_sources::{HistorySource, TraktClient, TraktClientOptions};

pub async fn run_auth(
    config: Option<PathBuf>,
    code: Option<String>,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, false)?;
    let ledger = setup::open_ledger(&ctx)?;
    let trakt = &ctx.settings.trakt;

    let token = if let Some(code) = code.or_else(|| trakt.auth_code.clone()) {
        auth::exchange_auth_code(&trakt.client_id, &trakt.client_secret, &code).await?
    } else if std::io::stdin().is_terminal() {
        interactive_bootstrap(&trakt.client_id, &trakt.client_secret).await?
    } else {
        return Err(eyre!(
            "not a terminal and no authorization code given; pass --code or set trakt.auth_code"
        ));
    };

    ledger.set_refresh_token(&token)?;
    output.success("Trakt authorization stored");

    let mut client = TraktClient::new(
        trakt.client_id.clone(),
        trakt.client_secret.clone(),
        Some(token),
        TraktClientOptions::default(),
    )?;
    if let Some(username) = client.username().await {
        output.info(format!("authenticated as {username}"));
    }
    // The verification request may have rotated the token.
    if let Some(rotated) = client.current_refresh_token() {
        ledger.set_refresh_token(&rotated)?;
    }
    Ok(())
}

async fn interactive_bootstrap(
    client_id: &str,
    client_secret: &str,
) -> color_eyre::Result<String> {
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How do you want to authorize?")
        .items(&[
            "Device code (approve in a browser)",
            "Paste an authorization code",
        ])
        .default(0)
        .interact()?;

    if choice == 1 {
        println!(
            "Open {} and approve the application.",
            auth::build_authorize_url(client_id).bold()
        );
        let code: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Authorization code")
            .interact_text()?;
        return Ok(auth::exchange_auth_code(client_id, client_secret, code.trim()).await?);
    }

    let device = auth::request_device_code(client_id).await?;
    println!(
        "Open {} and enter the code {}",
        device.verification_url.bold(),
        device.user_code.bold().green()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let token = auth::poll_device_token(client_id, client_secret, &device, |seconds_left| {
        spinner.set_message(format!("waiting for approval ({seconds_left}s left)"));
    })
    .await;
    spinner.finish_and_clear();
    Ok(token?)
}
