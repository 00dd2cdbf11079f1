use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use watchtally_models::{Cursor, EventRow, MediaType, WatchEvent};

const KEY_LAST_WATCHED_AT: &str = "last_watched_at";
const KEY_LAST_HISTORY_ID: &str = "last_history_id";
const KEY_BACKFILL_COMPLETED: &str = "backfill_completed";
const KEY_REFRESH_TOKEN: &str = "trakt_refresh_token";
pub const KEY_LAST_SUCCESSFUL_RUN: &str = "last_successful_run";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not create ledger directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger holds an unparseable value: {0}")]
    Corrupt(String),
}

/// Durable local store: progress state, the set of previously ingested
/// events (the dedup and reconciliation source of truth) and the dead-letter
/// log. Single-writer; every mutation is committed before the call returns.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        debug!(path = %path.display(), "opened ledger");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let ledger = Self {
            conn: Connection::open_in_memory()?,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_events (
                history_id INTEGER PRIMARY KEY,
                watched_at TEXT NOT NULL,
                media_type TEXT NOT NULL,
                trakt_id INTEGER NOT NULL,
                title_key TEXT NOT NULL,
                runtime_min REAL NOT NULL,
                is_rewatch INTEGER NOT NULL,
                show_trakt_id INTEGER,
                season_number INTEGER,
                episode_number INTEGER,
                year INTEGER,
                title TEXT,
                show_title TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_processed_events_watched_at
                ON processed_events(watched_at);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                history_id INTEGER,
                payload_json TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO sync_state(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn backfill_completed(&self) -> Result<bool, LedgerError> {
        Ok(self.get_state(KEY_BACKFILL_COMPLETED)?.as_deref() == Some("1"))
    }

    pub fn set_backfill_completed(&self, completed: bool) -> Result<(), LedgerError> {
        self.set_state(KEY_BACKFILL_COMPLETED, if completed { "1" } else { "0" })
    }

    pub fn refresh_token(&self) -> Result<Option<String>, LedgerError> {
        Ok(self.get_state(KEY_REFRESH_TOKEN)?.filter(|t| !t.is_empty()))
    }

    pub fn set_refresh_token(&self, token: &str) -> Result<(), LedgerError> {
        self.set_state(KEY_REFRESH_TOKEN, token)
    }

    pub fn clear_refresh_token(&self) -> Result<(), LedgerError> {
        self.set_state(KEY_REFRESH_TOKEN, "")
    }

    pub fn cursor(&self) -> Result<Option<Cursor>, LedgerError> {
        let watched_at = match self.get_state(KEY_LAST_WATCHED_AT)? {
            Some(raw) => parse_utc(&raw)?,
            None => return Ok(None),
        };
        let history_id = match self.get_state(KEY_LAST_HISTORY_ID)? {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| LedgerError::Corrupt(format!("cursor history id: {raw}")))?,
            None => return Ok(None),
        };
        Ok(Some(Cursor {
            watched_at,
            history_id,
        }))
    }

    pub fn set_cursor(&self, cursor: Cursor) -> Result<(), LedgerError> {
        self.set_state(KEY_LAST_WATCHED_AT, &fmt_utc(cursor.watched_at))?;
        self.set_state(KEY_LAST_HISTORY_ID, &cursor.history_id.to_string())
    }

    pub fn has_seen(&self, history_id: i64) -> Result<bool, LedgerError> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE history_id = ?1",
                params![history_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Bulk upsert in one transaction. Conflicts on `history_id` are silently
    /// ignored, so replaying already-seen events is safe.
    pub fn mark_seen_many(&mut self, events: &[WatchEvent]) -> Result<(), LedgerError> {
        if events.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO processed_events(
                    history_id, watched_at, media_type, trakt_id, title_key,
                    runtime_min, is_rewatch, show_trakt_id, season_number,
                    episode_number, year, title, show_title
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(history_id) DO NOTHING",
            )?;
            for event in events {
                stmt.execute(params![
                    event.history_id,
                    fmt_utc(event.watched_at),
                    event.media_type.as_str(),
                    event.trakt_id,
                    event.title_key(),
                    event.runtime_min,
                    event.is_rewatch as i64,
                    event.show_trakt_id,
                    event.season_number,
                    event.episode_number,
                    event.year,
                    event.title,
                    event.show_title,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Aggregation-input rows in `[start, end)`, ordered by
    /// `(watched_at, history_id)`.
    pub fn fetch_rows_in_range(
        &self,
        start_inclusive: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
    ) -> Result<Vec<EventRow>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT history_id, watched_at, media_type, title_key, runtime_min, is_rewatch
             FROM processed_events
             WHERE watched_at >= ?1 AND watched_at < ?2
             ORDER BY watched_at ASC, history_id ASC",
        )?;
        let raw: Vec<RawRow> = stmt
            .query_map(
                params![fmt_utc(start_inclusive), fmt_utc(end_exclusive)],
                raw_row_from_sql,
            )?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(RawRow::into_event_row).collect()
    }

    /// Full event rows in `[start, end)`, for sink rewrites.
    pub fn fetch_events_in_range(
        &self,
        start_inclusive: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
    ) -> Result<Vec<WatchEvent>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT history_id, watched_at, media_type, trakt_id, show_trakt_id,
                    season_number, episode_number, runtime_min, year, title,
                    show_title, is_rewatch
             FROM processed_events
             WHERE watched_at >= ?1 AND watched_at < ?2
             ORDER BY watched_at ASC, history_id ASC",
        )?;
        let raw: Vec<RawEvent> = stmt
            .query_map(
                params![fmt_utc(start_inclusive), fmt_utc(end_exclusive)],
                raw_event_from_sql,
            )?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(RawEvent::into_watch_event).collect()
    }

    /// Deletes the given history ids and returns the removed rows, so the
    /// caller can recompute the days they belonged to.
    pub fn delete_by_ids(&mut self, history_ids: &BTreeSet<i64>) -> Result<Vec<EventRow>, LedgerError> {
        if history_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; history_ids.len()].join(",");
        let tx = self.conn.transaction()?;
        let removed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT history_id, watched_at, media_type, title_key, runtime_min, is_rewatch
                 FROM processed_events WHERE history_id IN ({placeholders})"
            ))?;
            let raw: Vec<RawRow> = stmt
                .query_map(params_from_iter(history_ids.iter()), raw_row_from_sql)?
                .collect::<Result<_, _>>()?;
            tx.execute(
                &format!("DELETE FROM processed_events WHERE history_id IN ({placeholders})"),
                params_from_iter(history_ids.iter()),
            )?;
            raw
        };
        tx.commit()?;
        removed.into_iter().map(RawRow::into_event_row).collect()
    }

    /// Append-only; the core never deletes dead letters.
    pub fn record_dead_letter(
        &self,
        history_id: Option<i64>,
        payload: &Value,
        error: &str,
    ) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO dead_letters(history_id, payload_json, error, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![history_id, payload.to_string(), error, fmt_utc(Utc::now())],
        )?;
        Ok(())
    }

    pub fn dead_letter_count(&self) -> Result<u64, LedgerError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

struct RawRow {
    history_id: i64,
    watched_at: String,
    media_type: String,
    title_key: String,
    runtime_min: f64,
    is_rewatch: i64,
}

fn raw_row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        history_id: row.get(0)?,
        watched_at: row.get(1)?,
        media_type: row.get(2)?,
        title_key: row.get(3)?,
        runtime_min: row.get(4)?,
        is_rewatch: row.get(5)?,
    })
}

impl RawRow {
    fn into_event_row(self) -> Result<EventRow, LedgerError> {
        Ok(EventRow {
            history_id: self.history_id,
            watched_at: parse_utc(&self.watched_at)?,
            media_type: parse_media_type(&self.media_type)?,
            title_key: self.title_key,
            runtime_min: self.runtime_min,
            is_rewatch: self.is_rewatch != 0,
        })
    }
}

struct RawEvent {
    history_id: i64,
    watched_at: String,
    media_type: String,
    trakt_id: i64,
    show_trakt_id: Option<i64>,
    season_number: Option<i64>,
    episode_number: Option<i64>,
    runtime_min: f64,
    year: Option<i64>,
    title: Option<String>,
    show_title: Option<String>,
    is_rewatch: i64,
}

fn raw_event_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        history_id: row.get(0)?,
        watched_at: row.get(1)?,
        media_type: row.get(2)?,
        trakt_id: row.get(3)?,
        show_trakt_id: row.get(4)?,
        season_number: row.get(5)?,
        episode_number: row.get(6)?,
        runtime_min: row.get(7)?,
        year: row.get(8)?,
        title: row.get(9)?,
        show_title: row.get(10)?,
        is_rewatch: row.get(11)?,
    })
}

impl RawEvent {
    fn into_watch_event(self) -> Result<WatchEvent, LedgerError> {
        Ok(WatchEvent {
            history_id: self.history_id,
            watched_at: parse_utc(&self.watched_at)?,
            media_type: parse_media_type(&self.media_type)?,
            trakt_id: self.trakt_id,
            show_trakt_id: self.show_trakt_id,
            season_number: self.season_number,
            episode_number: self.episode_number,
            runtime_min: self.runtime_min,
            year: self.year,
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            show_title: self.show_title,
            is_rewatch: self.is_rewatch != 0,
        })
    }
}

fn fmt_utc(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| LedgerError::Corrupt(format!("timestamp: {raw}")))
}

fn parse_media_type(raw: &str) -> Result<MediaType, LedgerError> {
    match raw {
        "movie" => Ok(MediaType::Movie),
        "episode" => Ok(MediaType::Episode),
        other => Err(LedgerError::Corrupt(format!("media type: {other}"))),
    }
}
