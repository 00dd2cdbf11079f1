use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::aggregate::DailyAggregate;
use watchtally_models::WatchEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport error: {0}")]
    Transport(String),
    #[error("sink rejected the write: status {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

/// Idempotent, chunkable time-series writer. All methods must be no-ops on
/// empty input and safe to call repeatedly with the same data; the ledger is
/// the source of truth and the sink only ever mirrors it.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_raw_events(&self, events: &[WatchEvent]) -> Result<(), SinkError>;

    async fn write_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), SinkError>;

    /// Remove all raw events with timestamps in `[start, end)`.
    async fn delete_raw_events_range(
        &self,
        start_inclusive: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Drop-in sink for runs without a time-series backend and for tests.
pub struct NoopSink;

#[async_trait]
impl Sink for NoopSink {
    async fn write_raw_events(&self, _events: &[WatchEvent]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write_daily_aggregates(&self, _aggregates: &[DailyAggregate]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn delete_raw_events_range(
        &self,
        _start_inclusive: DateTime<Utc>,
        _end_exclusive: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}
