//! InfluxDB line-protocol rendering for the two measurements this crate
//! writes: `watch_event` (one point per history entry, timestamped at the
//! watch instant) and `watch_daily` (one point per day and scope).

use watchtally_core::DailyAggregate;
use watchtally_models::{MediaType, WatchEvent};

pub(crate) const RAW_MEASUREMENT: &str = "watch_event";
pub(crate) const DAILY_MEASUREMENT: &str = "watch_daily";

pub(crate) fn event_line(event: &WatchEvent) -> String {
    let mut fields = vec![
        format!("history_id={}i", event.history_id),
        format!("trakt_id={}i", event.trakt_id),
        format!("runtime_min={}", event.runtime_min),
        format!("title={}", string_field(&event.title)),
        format!("is_rewatch={}", event.is_rewatch),
    ];
    if let Some(year) = event.year {
        fields.push(format!("year={year}i"));
    }
    if event.media_type == MediaType::Episode {
        if let Some(show_id) = event.show_trakt_id {
            fields.push(format!("show_trakt_id={show_id}i"));
        }
        if let Some(show_title) = &event.show_title {
            fields.push(format!("show_title={}", string_field(show_title)));
        }
        if let Some(season) = event.season_number {
            fields.push(format!("season={season}i"));
        }
        if let Some(number) = event.episode_number {
            fields.push(format!("episode={number}i"));
        }
    }

    format!(
        "{},media_type={} {} {}",
        RAW_MEASUREMENT,
        event.media_type.as_str(),
        fields.join(","),
        event.watched_at.timestamp()
    )
}

pub(crate) fn daily_line(aggregate: &DailyAggregate) -> String {
    format!(
        "{},scope={} events_count={}i,unique_titles_count={}i,watch_minutes_total={},rewatch_events_count={}i,first_watch_events_count={}i {}",
        DAILY_MEASUREMENT,
        aggregate.scope.as_str(),
        aggregate.events_count,
        aggregate.unique_titles_count,
        aggregate.watch_minutes_total,
        aggregate.rewatch_events_count,
        aggregate.first_watch_events_count,
        aggregate.day_start_utc.timestamp()
    )
}

/// Field string values quote with `"` and escape backslashes and quotes.
fn string_field(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use watchtally_core::AggregateScope;

    fn movie() -> WatchEvent {
        WatchEvent {
            history_id: 1001,
            watched_at: Utc.with_ymd_and_hms(2024, 3, 1, 20, 30, 0).unwrap(),
            media_type: MediaType::Movie,
            trakt_id: 77,
            show_trakt_id: None,
            season_number: None,
            episode_number: None,
            runtime_min: 170.0,
            year: Some(1995),
            title: "Heat".to_string(),
            show_title: None,
            is_rewatch: false,
        }
    }

    #[test]
    fn renders_movie_line() {
        assert_eq!(
            event_line(&movie()),
            "watch_event,media_type=movie history_id=1001i,trakt_id=77i,runtime_min=170,\
             title=\"Heat\",is_rewatch=false,year=1995i 1709325000"
        );
    }

    #[test]
    fn renders_episode_fields() {
        let event = WatchEvent {
            media_type: MediaType::Episode,
            show_trakt_id: Some(1388),
            season_number: Some(5),
            episode_number: Some(14),
            show_title: Some("Breaking Bad".to_string()),
            ..movie()
        };
        let line = event_line(&event);
        assert!(line.starts_with("watch_event,media_type=episode "));
        assert!(line.contains("show_trakt_id=1388i"));
        assert!(line.contains("show_title=\"Breaking Bad\""));
        assert!(line.contains("season=5i"));
        assert!(line.contains("episode=14i"));
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_titles() {
        let event = WatchEvent {
            title: "The \"Big\" C:\\".to_string(),
            ..movie()
        };
        assert!(event_line(&event).contains("title=\"The \\\"Big\\\" C:\\\\\""));
    }

    #[test]
    fn renders_daily_line() {
        let aggregate = DailyAggregate {
            day_start_utc: Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap(),
            scope: AggregateScope::All,
            events_count: 3,
            unique_titles_count: 2,
            watch_minutes_total: 210.0,
            rewatch_events_count: 1,
            first_watch_events_count: 2,
        };
        assert_eq!(
            daily_line(&aggregate),
            "watch_daily,scope=all events_count=3i,unique_titles_count=2i,\
             watch_minutes_total=210,rewatch_events_count=1i,first_watch_events_count=2i 1712016000"
        );
    }
}
