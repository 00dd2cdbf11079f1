use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::debug;

use crate::line::{daily_line, event_line, RAW_MEASUREMENT};
use watchtally_core::{DailyAggregate, Sink, SinkError};
use watchtally_models::WatchEvent;

/// One write call carries at most this many points.
const WRITE_CHUNK_SIZE: usize = 2500;

#[derive(Debug, Clone)]
pub struct InfluxOptions {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket_raw: String,
    pub bucket_agg: String,
}

/// InfluxDB 2.x sink. Writes are idempotent on the server side: a point with
/// the same measurement, tag set and timestamp replaces the previous one, so
/// replaying a batch or rewriting a whole day needs no client bookkeeping.
pub struct InfluxSink {
    http: reqwest::Client,
    options: InfluxOptions,
}

impl InfluxSink {
    pub fn new(http: reqwest::Client, options: InfluxOptions) -> Self {
        Self { http, options }
    }

    async fn write_lines(&self, bucket: &str, lines: Vec<String>) -> Result<(), SinkError> {
        for chunk in lines.chunks(WRITE_CHUNK_SIZE) {
            let response = self
                .http
                .post(format!("{}/api/v2/write", self.options.url))
                .query(&[
                    ("org", self.options.org.as_str()),
                    ("bucket", bucket),
                    ("precision", "s"),
                ])
                .header("Authorization", format!("Token {}", self.options.token))
                .body(chunk.join("\n"))
                .send()
                .await
                .map_err(transport)?;
            check_status(response).await?;
            debug!(bucket, points = chunk.len(), "wrote points");
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write_raw_events(&self, events: &[WatchEvent]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        let lines = events.iter().map(event_line).collect();
        self.write_lines(&self.options.bucket_raw, lines).await
    }

    async fn write_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), SinkError> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let lines = aggregates.iter().map(daily_line).collect();
        self.write_lines(&self.options.bucket_agg, lines).await
    }

    async fn delete_raw_events_range(
        &self,
        start_inclusive: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let body = json!({
            "start": fmt(start_inclusive),
            "stop": fmt(end_exclusive),
            "predicate": format!("_measurement=\"{RAW_MEASUREMENT}\""),
        });
        let response = self
            .http
            .post(format!("{}/api/v2/delete", self.options.url))
            .query(&[
                ("org", self.options.org.as_str()),
                ("bucket", self.options.bucket_raw.as_str()),
            ])
            .header("Authorization", format!("Token {}", self.options.token))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await?;
        debug!(start = %start_inclusive, end = %end_exclusive, "deleted raw event range");
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .get(format!("{}/ping", self.options.url))
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await
    }
}

fn fmt(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn transport(error: reqwest::Error) -> SinkError {
    SinkError::Transport(error.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let detail = response.text().await.unwrap_or_default();
    Err(SinkError::Rejected {
        status: status.as_u16(),
        detail,
    })
}
