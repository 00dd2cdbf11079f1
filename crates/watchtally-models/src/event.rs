use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Episode => "episode",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized history entry as returned by the remote account.
///
/// `history_id` is the remote-assigned identity used for deduplication;
/// `title_key` is a separate identity used only to count unique titles in
/// aggregates (two plays of the same episode share a title key but never a
/// history id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub history_id: i64,
    pub watched_at: DateTime<Utc>,
    pub media_type: MediaType,
    pub trakt_id: i64,
    pub show_trakt_id: Option<i64>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub runtime_min: f64,
    pub year: Option<i64>,
    pub title: String,
    pub show_title: Option<String>,
    pub is_rewatch: bool,
}

impl WatchEvent {
    /// Stable per-title identity. Episodes key on the show plus season and
    /// episode numbers, falling back to the show title when the show carries
    /// no numeric id. Movies key on their primary id.
    pub fn title_key(&self) -> String {
        match self.media_type {
            MediaType::Episode => {
                let show_part = match self.show_trakt_id {
                    Some(id) => id.to_string(),
                    None => self
                        .show_title
                        .clone()
                        .unwrap_or_else(|| "unknown_show".to_string()),
                };
                format!(
                    "episode:{}:s{}:e{}",
                    show_part,
                    self.season_number.unwrap_or(0),
                    self.episode_number.unwrap_or(0)
                )
            }
            MediaType::Movie => format!("movie:{}", self.trakt_id),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            watched_at: self.watched_at,
            history_id: self.history_id,
        }
    }
}

/// Slim projection of a ledger row, enough to build daily aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub history_id: i64,
    pub watched_at: DateTime<Utc>,
    pub media_type: MediaType,
    pub title_key: String,
    pub runtime_min: f64,
    pub is_rewatch: bool,
}
