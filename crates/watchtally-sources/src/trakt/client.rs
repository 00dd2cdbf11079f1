use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::traits::{HistoryPage, HistorySource, SyncWindow};

pub const DEFAULT_BASE_URL: &str = "https://api.trakt.tv";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const USER_AGENT: &str = "watchtally/0.1";

const MAX_BACKOFF_SECONDS: f64 = 30.0;
const JITTER_MAX_SECONDS: f64 = 0.25;
/// Refresh a little before hard expiry to reduce edge failures.
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;

pub fn create_http_client() -> Result<Client, SourceError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|error| SourceError::Network(format!("could not build HTTP client: {error}")))
}

#[derive(Debug, Clone)]
pub struct TraktClientOptions {
    /// Retry budget per request; attempts = retries + 1.
    pub max_retries: u32,
    /// Seconds added on top of the server's Retry-After before retrying a 429.
    pub retry_after_margin: f64,
    /// Minimum spacing between requests, measured from the end of the
    /// previous one. Zero disables throttling.
    pub min_request_interval: Duration,
    pub per_page: u32,
}

impl Default for TraktClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_after_margin: 0.9,
            min_request_interval: Duration::ZERO,
            per_page: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

/// Authenticated, paginated, retrying client over the Trakt history API.
/// Owns the access-token lifecycle; the refresh token it holds may rotate,
/// so callers persist [`TraktClient::current_refresh_token`] after each job.
pub struct TraktClient {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: Option<String>,
    access_token: Option<String>,
    access_token_expires_at: DateTime<Utc>,
    last_request_finished: Option<Instant>,
    options: TraktClientOptions,
}

impl TraktClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        refresh_token: Option<String>,
        options: TraktClientOptions,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            http: create_http_client()?,
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id,
            client_secret,
            refresh_token,
            access_token: None,
            access_token_expires_at: Utc::now(),
            last_request_finished: None,
            options,
        })
    }

    /// Username of the authenticated account, for display only. Failures are
    /// logged at debug and swallowed.
    pub async fn username(&mut self) -> Option<String> {
        match self.request(Method::GET, "/users/settings", &[]).await {
            Ok(response) => response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.pointer("/user/username")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
            Err(error) => {
                debug!(error = %error, "failed to fetch Trakt username");
                None
            }
        }
    }

    async fn request(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Response, SourceError> {
        let retries = self.options.max_retries;
        let mut attempt: u32 = 0;

        loop {
            self.ensure_access_token().await?;
            self.throttle().await;

            let url = format!("{}{}", self.base_url, path);
            let access_token = self.access_token.clone().unwrap_or_default();
            let outcome = self
                .http
                .request(method.clone(), &url)
                .header("Content-Type", "application/json")
                .header("trakt-api-key", &self.client_id)
                .header("trakt-api-version", "2")
                .bearer_auth(access_token)
                .query(query)
                .send()
                .await;
            self.last_request_finished = Some(Instant::now());

            let response = match outcome {
                Ok(response) => response,
                Err(error) => {
                    if attempt >= retries {
                        return Err(SourceError::Network(error.to_string()));
                    }
                    let sleep_s = backoff_base_seconds(attempt) + jitter_seconds();
                    warn!(
                        attempt = attempt + 1,
                        sleep_s,
                        error = %error,
                        "network error talking to Trakt, retrying"
                    );
                    sleep(Duration::from_secs_f64(sleep_s)).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            let request_id = header_str(&response, "X-Request-Id").unwrap_or_default();
            let request_id = request_id.as_str();

            if status == StatusCode::UNAUTHORIZED {
                if attempt >= retries {
                    return Err(SourceError::Client {
                        status: status.as_u16(),
                        detail: response_detail(response).await,
                    });
                }
                warn!(attempt = attempt + 1, request_id, "Trakt returned 401, forcing token refresh");
                self.refresh_access_token(true).await?;
                attempt += 1;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(header_str(&response, "Retry-After").as_deref());
                if attempt >= retries {
                    return Err(SourceError::RateLimit {
                        retry_after_s: retry_after,
                    });
                }
                let sleep_s = rate_limit_sleep_seconds(retry_after, self.options.retry_after_margin);
                warn!(attempt = attempt + 1, sleep_s, request_id, "Trakt rate limited the request");
                sleep(Duration::from_secs_f64(sleep_s)).await;
                attempt += 1;
                continue;
            }

            if status.is_server_error() {
                if attempt >= retries {
                    return Err(SourceError::Server {
                        status: status.as_u16(),
                        detail: response_detail(response).await,
                    });
                }
                let sleep_s = backoff_base_seconds(attempt) + jitter_seconds();
                warn!(
                    attempt = attempt + 1,
                    sleep_s,
                    status = status.as_u16(),
                    request_id,
                    "Trakt server error, retrying"
                );
                sleep(Duration::from_secs_f64(sleep_s)).await;
                attempt += 1;
                continue;
            }

            if status.is_client_error() {
                return Err(SourceError::Client {
                    status: status.as_u16(),
                    detail: response_detail(response).await,
                });
            }

            return Ok(response);
        }
    }

    async fn ensure_access_token(&mut self) -> Result<(), SourceError> {
        if self.access_token.is_none() || Utc::now() >= self.access_token_expires_at {
            self.refresh_access_token(false).await?;
        }
        Ok(())
    }

    async fn refresh_access_token(&mut self, force: bool) -> Result<(), SourceError> {
        if !force && self.access_token.is_some() && Utc::now() < self.access_token_expires_at {
            return Ok(());
        }
        let refresh_token = self
            .refresh_token
            .clone()
            .ok_or(SourceError::Authentication)?;

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "redirect_uri": REDIRECT_URI,
            }))
            .send()
            .await
            .map_err(|error| SourceError::Network(format!("token refresh failed: {error}")))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            warn!(status = status.as_u16(), "Trakt rejected the refresh token");
            return Err(SourceError::Authentication);
        }
        if status.is_server_error() {
            return Err(SourceError::Server {
                status: status.as_u16(),
                detail: response_detail(response).await,
            });
        }
        if !status.is_success() {
            return Err(SourceError::Client {
                status: status.as_u16(),
                detail: response_detail(response).await,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|error| SourceError::Protocol(format!("bad token response: {error}")))?;

        self.access_token = Some(token.access_token);
        self.access_token_expires_at = Utc::now()
            + chrono::Duration::seconds(token_lifetime_seconds(token.expires_in));

        if let Some(rotated) = token.refresh_token {
            if rotated != refresh_token {
                debug!("Trakt rotated the refresh token");
            }
            self.refresh_token = Some(rotated);
        }
        Ok(())
    }

    async fn throttle(&self) {
        let min_interval = self.options.min_request_interval;
        if min_interval.is_zero() {
            return;
        }
        if let Some(finished) = self.last_request_finished {
            let elapsed = finished.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }
    }
}

#[async_trait]
impl HistorySource for TraktClient {
    async fn history_page(
        &mut self,
        window: &SyncWindow,
        page: u32,
    ) -> Result<HistoryPage, SourceError> {
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("limit", self.options.per_page.to_string()),
            ("extended", "full".to_string()),
        ];
        if let Some(start_at) = window.start_at {
            query.push(("start_at", to_trakt_iso(start_at)));
        }
        if let Some(end_at) = window.end_at {
            query.push(("end_at", to_trakt_iso(end_at)));
        }

        let response = self.request(Method::GET, "/sync/history", &query).await?;
        let page_count = header_u32(&response, "X-Pagination-Page-Count").map(|count| count.max(1));
        let item_count = header_u64(&response, "X-Pagination-Item-Count");

        let records: Vec<Value> = response.json().await.map_err(|error| {
            SourceError::Protocol(format!("history page was not a JSON array: {error}"))
        })?;
        let last = is_last_page(page, page_count, records.len(), self.options.per_page);

        Ok(HistoryPage {
            records,
            page_count,
            item_count,
            last,
        })
    }

    fn current_refresh_token(&self) -> Option<String> {
        self.refresh_token.clone()
    }
}

/// Capped exponential backoff; jitter is added separately at the sleep site.
fn backoff_base_seconds(attempt: u32) -> f64 {
    2f64.powi(attempt.min(10) as i32).min(MAX_BACKOFF_SECONDS)
}

fn jitter_seconds() -> f64 {
    rand::thread_rng().gen_range(0.0..=JITTER_MAX_SECONDS)
}

fn rate_limit_sleep_seconds(retry_after: f64, margin: f64) -> f64 {
    (retry_after + margin).max(1.0)
}

fn parse_retry_after(raw: Option<&str>) -> f64 {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .map(|seconds| seconds.max(1.0))
        .unwrap_or(1.0)
}

fn token_lifetime_seconds(expires_in: Option<i64>) -> i64 {
    (expires_in.unwrap_or(3600) - TOKEN_EXPIRY_MARGIN_SECONDS).max(TOKEN_EXPIRY_MARGIN_SECONDS)
}

/// Stop rules: a page-count header marks the final page; without the header
/// a short page does. The zero-item case is handled by the consumer.
fn is_last_page(page: u32, page_count: Option<u32>, records_len: usize, per_page: u32) -> bool {
    match page_count {
        Some(count) => page >= count,
        None => records_len < per_page as usize,
    }
}

fn to_trakt_iso(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn header_u32(response: &Response, name: &str) -> Option<u32> {
    header_str(response, name).and_then(|value| value.trim().parse().ok())
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    header_str(response, name).and_then(|value| value.trim().parse().ok())
}

async fn response_detail(response: Response) -> String {
    match response.text().await {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                "<empty>".to_string()
            } else {
                trimmed.chars().take(512).collect()
            }
        }
        Err(_) => "<unreadable>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one scripted (status, body) per connection, in order, then stops
    /// accepting. Responses carry `Connection: close` so every request the
    /// client makes lands on a fresh connection and the script stays in step.
    async fn scripted_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (base_url, hits)
    }

    /// Client wired to a local fixture with a still-valid access token, so no
    /// refresh happens unless the fixture provokes one. The bare reqwest
    /// client carries no timeout; paused test time would fire one instantly.
    fn fixture_client(base_url: String, max_retries: u32) -> TraktClient {
        TraktClient {
            http: Client::new(),
            base_url,
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            access_token: Some("access-1".to_string()),
            access_token_expires_at: Utc::now() + chrono::Duration::hours(1),
            last_request_finished: None,
            options: TraktClientOptions {
                max_retries,
                ..TraktClientOptions::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_server_errors_then_success_retries_through() {
        let mut responses: Vec<(u16, String)> = (0..5).map(|_| (500, String::new())).collect();
        responses.push((200, "[]".to_string()));
        let (base_url, hits) = scripted_server(responses).await;

        let mut client = fixture_client(base_url, 5);
        let started = Instant::now();
        let page = client
            .history_page(&SyncWindow::default(), 1)
            .await
            .unwrap();

        assert!(page.records.is_empty());
        assert!(page.last);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
        // Five backoff sleeps: 1 + 2 + 4 + 8 + 16 seconds plus bounded jitter.
        let slept = started.elapsed().as_secs_f64();
        assert!(slept >= 31.0, "slept only {slept}s");
        assert!(slept <= 31.0 + 5.0 * JITTER_MAX_SECONDS + 1.0, "slept {slept}s");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_server_error() {
        let responses = vec![(503, String::new()); 3];
        let (base_url, hits) = scripted_server(responses).await;

        let mut client = fixture_client(base_url, 2);
        let error = client
            .history_page(&SyncWindow::default(), 1)
            .await
            .unwrap_err();

        assert!(matches!(error, SourceError::Server { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_forces_a_refresh_and_retries() {
        let token_body =
            r#"{"access_token":"access-2","expires_in":7200,"refresh_token":"refresh-2"}"#;
        let responses = vec![
            (401, String::new()),
            (200, token_body.to_string()),
            (200, "[]".to_string()),
        ];
        let (base_url, hits) = scripted_server(responses).await;

        let mut client = fixture_client(base_url, 5);
        let page = client
            .history_page(&SyncWindow::default(), 1)
            .await
            .unwrap();

        assert!(page.last);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(client.access_token.as_deref(), Some("access-2"));
        assert_eq!(client.current_refresh_token().as_deref(), Some("refresh-2"));
    }

    #[test]
    fn http_client_builds() {
        assert!(create_http_client().is_ok());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_base_seconds(0), 1.0);
        assert_eq!(backoff_base_seconds(1), 2.0);
        assert_eq!(backoff_base_seconds(4), 16.0);
        for attempt in 0..20 {
            assert!(backoff_base_seconds(attempt) <= MAX_BACKOFF_SECONDS);
        }
        assert_eq!(backoff_base_seconds(7), MAX_BACKOFF_SECONDS);
    }

    #[test]
    fn rate_limit_sleep_honors_margin() {
        assert!(rate_limit_sleep_seconds(2.0, 0.9) >= 2.9);
        // Floors at one second even for tiny Retry-After values.
        assert_eq!(rate_limit_sleep_seconds(0.0, 0.5), 1.0);
    }

    #[test]
    fn retry_after_parsing_defaults_and_floors() {
        assert_eq!(parse_retry_after(None), 1.0);
        assert_eq!(parse_retry_after(Some("not-a-number")), 1.0);
        assert_eq!(parse_retry_after(Some("0.2")), 1.0);
        assert_eq!(parse_retry_after(Some("7")), 7.0);
    }

    #[test]
    fn token_lifetime_keeps_a_floor() {
        assert_eq!(token_lifetime_seconds(Some(3600)), 3540);
        assert_eq!(token_lifetime_seconds(Some(30)), 60);
        assert_eq!(token_lifetime_seconds(None), 3540);
    }

    #[test]
    fn last_page_detection() {
        // Header present: trust it.
        assert!(is_last_page(3, Some(3), 100, 100));
        assert!(!is_last_page(2, Some(3), 100, 100));
        // No header: a short page is the last one.
        assert!(is_last_page(1, None, 40, 100));
        assert!(!is_last_page(1, None, 100, 100));
    }

    #[test]
    fn window_bounds_use_second_precision_utc() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 5).unwrap();
        assert_eq!(to_trakt_iso(at), "2024-06-01T12:30:05Z");
    }
}
