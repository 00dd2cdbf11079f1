use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::event::{MediaType, WatchEvent};

/// A single malformed remote record. Recovered by the caller as a dead
/// letter; never aborts a sync pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("missing trakt id in payload")]
    MissingTraktId,
    #[error("missing watched_at in payload")]
    MissingWatchedAt,
    #[error("unparseable watched_at in payload: {0}")]
    InvalidWatchedAt(String),
    #[error("missing history id in payload")]
    MissingHistoryId,
}

/// Maps one raw history record to a canonical [`WatchEvent`]. Pure; the raw
/// payload is left untouched so the caller can dead-letter it verbatim.
pub fn normalize_history_record(payload: &Value) -> Result<WatchEvent, ValidationError> {
    let media_type = match payload.get("type").and_then(Value::as_str) {
        Some("movie") => MediaType::Movie,
        Some("episode") => MediaType::Episode,
        other => {
            return Err(ValidationError::UnsupportedMediaType(
                other.unwrap_or("<missing>").to_string(),
            ))
        }
    };

    let primary = payload
        .get(media_type.as_str())
        .cloned()
        .unwrap_or(Value::Null);
    let trakt_id = primary
        .pointer("/ids/trakt")
        .and_then(Value::as_i64)
        .ok_or(ValidationError::MissingTraktId)?;

    let show = match media_type {
        MediaType::Episode => payload.get("show").cloned().unwrap_or(Value::Null),
        MediaType::Movie => Value::Null,
    };

    let watched_at_raw = payload
        .get("watched_at")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingWatchedAt)?;
    let watched_at = parse_utc(watched_at_raw)
        .ok_or_else(|| ValidationError::InvalidWatchedAt(watched_at_raw.to_string()))?;

    let history_id = payload
        .get("id")
        .and_then(Value::as_i64)
        .ok_or(ValidationError::MissingHistoryId)?;

    Ok(WatchEvent {
        history_id,
        watched_at,
        media_type,
        trakt_id,
        show_trakt_id: show.pointer("/ids/trakt").and_then(Value::as_i64),
        season_number: primary.get("season").and_then(Value::as_i64),
        episode_number: primary.get("number").and_then(Value::as_i64),
        runtime_min: primary
            .get("runtime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        year: primary.get("year").and_then(Value::as_i64),
        title: primary
            .get("title")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown")
            .to_string(),
        show_title: show
            .get("title")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        is_rewatch: payload
            .get("rewatched")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn movie_payload() -> Value {
        json!({
            "id": 1001,
            "watched_at": "2024-03-01T20:30:00.000Z",
            "type": "movie",
            "movie": {
                "title": "Heat",
                "year": 1995,
                "runtime": 170,
                "ids": { "trakt": 77 }
            }
        })
    }

    #[test]
    fn normalizes_movie() {
        let event = normalize_history_record(&movie_payload()).unwrap();
        assert_eq!(event.history_id, 1001);
        assert_eq!(event.media_type, MediaType::Movie);
        assert_eq!(event.trakt_id, 77);
        assert_eq!(event.runtime_min, 170.0);
        assert_eq!(event.year, Some(1995));
        assert_eq!(event.title, "Heat");
        assert_eq!(
            event.watched_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 20, 30, 0).unwrap()
        );
        assert!(!event.is_rewatch);
    }

    #[test]
    fn normalizes_episode_with_show() {
        let payload = json!({
            "id": 2002,
            "watched_at": "2024-03-02T21:00:00Z",
            "type": "episode",
            "rewatched": true,
            "episode": {
                "title": "Ozymandias",
                "season": 5,
                "number": 14,
                "runtime": 47,
                "ids": { "trakt": 888 }
            },
            "show": {
                "title": "Breaking Bad",
                "ids": { "trakt": 1388 }
            }
        });
        let event = normalize_history_record(&payload).unwrap();
        assert_eq!(event.media_type, MediaType::Episode);
        assert_eq!(event.show_trakt_id, Some(1388));
        assert_eq!(event.season_number, Some(5));
        assert_eq!(event.episode_number, Some(14));
        assert_eq!(event.show_title.as_deref(), Some("Breaking Bad"));
        assert!(event.is_rewatch);
        assert_eq!(event.title_key(), "episode:1388:s5:e14");
    }

    #[test]
    fn rejects_unknown_media_type() {
        let mut payload = movie_payload();
        payload["type"] = json!("season");
        assert_eq!(
            normalize_history_record(&payload),
            Err(ValidationError::UnsupportedMediaType("season".to_string()))
        );
    }

    #[test]
    fn rejects_missing_primary_id() {
        let mut payload = movie_payload();
        payload["movie"]["ids"] = json!({});
        assert_eq!(
            normalize_history_record(&payload),
            Err(ValidationError::MissingTraktId)
        );
    }

    #[test]
    fn rejects_missing_watched_at() {
        let mut payload = movie_payload();
        payload.as_object_mut().unwrap().remove("watched_at");
        assert_eq!(
            normalize_history_record(&payload),
            Err(ValidationError::MissingWatchedAt)
        );
    }

    #[test]
    fn rejects_missing_history_id() {
        let mut payload = movie_payload();
        payload.as_object_mut().unwrap().remove("id");
        assert_eq!(
            normalize_history_record(&payload),
            Err(ValidationError::MissingHistoryId)
        );
    }

    #[test]
    fn runtime_defaults_to_zero() {
        let mut payload = movie_payload();
        payload["movie"].as_object_mut().unwrap().remove("runtime");
        let event = normalize_history_record(&payload).unwrap();
        assert_eq!(event.runtime_min, 0.0);
    }
}
