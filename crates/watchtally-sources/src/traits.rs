use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SourceError;

/// Half-open fetch window. `None` bounds mean unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncWindow {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl SyncWindow {
    pub fn between(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        Self {
            start_at: Some(start_at),
            end_at: Some(end_at),
        }
    }

    pub fn from(start_at: Option<DateTime<Utc>>) -> Self {
        Self {
            start_at,
            end_at: None,
        }
    }
}

/// One page of raw history records. The source decides when paging stops;
/// consumers only look at `records` and `last`.
#[derive(Debug, Default)]
pub struct HistoryPage {
    pub records: Vec<Value>,
    pub page_count: Option<u32>,
    pub item_count: Option<u64>,
    /// True when the source determined this is the final page of the window.
    pub last: bool,
}

/// Seam between the sync engine and the remote account. A window is fetched
/// page by page, restartable only from page 1; ordering within a window is
/// whatever the remote returns and consumers must not rely on it beyond
/// "within a page".
#[async_trait]
pub trait HistorySource: Send {
    /// Fetch one page of the window. Pages start at 1. An empty `records`
    /// vector also terminates the window.
    async fn history_page(&mut self, window: &SyncWindow, page: u32)
        -> Result<HistoryPage, SourceError>;

    /// The refresh token currently held, which may have been rotated by the
    /// remote since construction. Callers persist it after every job.
    fn current_refresh_token(&self) -> Option<String>;
}
