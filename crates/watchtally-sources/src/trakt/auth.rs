//! First-time OAuth bootstrap: authorization-code exchange and the device
//! flow. Only the CLI calls into this module; the sync engine itself never
//! does interactive authentication.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::trakt::client::{create_http_client, DEFAULT_BASE_URL};

const AUTHORIZE_URL: &str = "https://trakt.tv/oauth/authorize";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

pub fn build_authorize_url(client_id: &str) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}",
        AUTHORIZE_URL, client_id, REDIRECT_URI
    )
}

#[derive(Debug, Deserialize)]
struct BootstrapTokenResponse {
    refresh_token: Option<String>,
}

/// Exchange an authorization code for a refresh token.
pub async fn exchange_auth_code(
    client_id: &str,
    client_secret: &str,
    code: &str,
) -> Result<String, SourceError> {
    let http = create_http_client()?;
    let response = http
        .post(format!("{}/oauth/token", DEFAULT_BASE_URL))
        .json(&serde_json::json!({
            "code": code,
            "client_id": client_id,
            "client_secret": client_secret,
            "redirect_uri": REDIRECT_URI,
            "grant_type": "authorization_code",
        }))
        .send()
        .await
        .map_err(|error| SourceError::Network(error.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(SourceError::Client {
            status: status.as_u16(),
            detail: detail.trim().chars().take(512).collect(),
        });
    }

    let token: BootstrapTokenResponse = response
        .json()
        .await
        .map_err(|error| SourceError::Protocol(format!("bad token response: {error}")))?;
    token.refresh_token.ok_or_else(|| {
        SourceError::Protocol("code exchange did not return a refresh token".to_string())
    })
}

#[derive(Debug, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    #[serde(default = "default_device_expiry")]
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_device_expiry() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    5
}

/// Ask Trakt for a device code the user can approve in a browser.
pub async fn request_device_code(client_id: &str) -> Result<DeviceAuthorization, SourceError> {
    let http = create_http_client()?;
    let response = http
        .post(format!("{}/oauth/device/code", DEFAULT_BASE_URL))
        .json(&serde_json::json!({ "client_id": client_id }))
        .send()
        .await
        .map_err(|error| SourceError::Network(error.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(SourceError::Client {
            status: status.as_u16(),
            detail: detail.trim().chars().take(512).collect(),
        });
    }

    response
        .json()
        .await
        .map_err(|error| SourceError::Protocol(format!("bad device code response: {error}")))
}

/// Poll the device token endpoint until the user approves, the code expires,
/// or Trakt rejects the authorization. `on_wait` is called before each poll
/// with the remaining seconds, for status rendering.
pub async fn poll_device_token(
    client_id: &str,
    client_secret: &str,
    device: &DeviceAuthorization,
    mut on_wait: impl FnMut(u64),
) -> Result<String, SourceError> {
    let http = create_http_client()?;
    let deadline = Instant::now() + Duration::from_secs(device.expires_in);
    let mut poll_interval = device.interval.max(1);

    while Instant::now() < deadline {
        let seconds_left = deadline
            .saturating_duration_since(Instant::now())
            .as_secs();
        on_wait(seconds_left);
        sleep(Duration::from_secs(poll_interval)).await;

        let response = http
            .post(format!("{}/oauth/device/token", DEFAULT_BASE_URL))
            .json(&serde_json::json!({
                "code": device.device_code,
                "client_id": client_id,
                "client_secret": client_secret,
            }))
            .send()
            .await
            .map_err(|error| SourceError::Network(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let token: BootstrapTokenResponse = response.json().await.map_err(|error| {
                SourceError::Protocol(format!("bad device token response: {error}"))
            })?;
            info!("device authorization confirmed");
            return token.refresh_token.ok_or_else(|| {
                SourceError::Protocol("device token response missing refresh_token".to_string())
            });
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let error_code = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        debug!(status = status.as_u16(), error = %error_code, "device token poll");

        match (status.as_u16(), error_code.as_str()) {
            // Some deployments answer 400 with an empty body until approval.
            (400, "authorization_pending") | (400, "unknown_error") => continue,
            (400, "slow_down") => {
                poll_interval = (poll_interval + 5).min(30);
                info!(poll_interval_s = poll_interval, "device polling slowed down");
            }
            (400, "expired_token") | (400, "access_denied") => {
                warn!(error = %error_code, "device authorization failed");
                return Err(SourceError::Authentication);
            }
            _ => {
                return Err(SourceError::Client {
                    status: status.as_u16(),
                    detail: error_code,
                });
            }
        }
    }

    warn!("device authorization timed out before approval");
    Err(SourceError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_oob_redirect() {
        let url = build_authorize_url("abc123");
        assert!(url.starts_with("https://trakt.tv/oauth/authorize?"));
        assert!(url.contains("client_id=abc123"));
        assert!(url.contains("redirect_uri=urn:ietf:wg:oauth:2.0:oob"));
    }

    #[test]
    fn device_authorization_defaults() {
        let device: DeviceAuthorization = serde_json::from_value(serde_json::json!({
            "device_code": "d",
            "user_code": "U1",
            "verification_url": "https://trakt.tv/activate",
        }))
        .unwrap();
        assert_eq!(device.expires_in, 600);
        assert_eq!(device.interval, 5);
    }
}
