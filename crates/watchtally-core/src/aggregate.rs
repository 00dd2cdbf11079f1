use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use watchtally_models::{EventRow, MediaType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateScope {
    All,
    Movie,
    Episode,
}

impl AggregateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateScope::All => "all",
            AggregateScope::Movie => "movie",
            AggregateScope::Episode => "episode",
        }
    }

    fn matches(&self, media_type: MediaType) -> bool {
        match self {
            AggregateScope::All => true,
            AggregateScope::Movie => media_type == MediaType::Movie,
            AggregateScope::Episode => media_type == MediaType::Episode,
        }
    }
}

/// Per-day statistical rollup. Carries no state of its own: always fully
/// recomputable from the ledger rows of the same day, and replaced (never
/// updated) whenever that day changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub day_start_utc: DateTime<Utc>,
    pub scope: AggregateScope,
    pub events_count: u64,
    pub unique_titles_count: u64,
    pub watch_minutes_total: f64,
    pub rewatch_events_count: u64,
    pub first_watch_events_count: u64,
}

/// Builds one aggregate per non-empty scope in {all, movie, episode}.
/// Pure and deterministic.
pub fn build_daily_aggregates(rows: &[EventRow], day_start_utc: DateTime<Utc>) -> Vec<DailyAggregate> {
    let mut outputs = Vec::new();

    for scope in [AggregateScope::All, AggregateScope::Movie, AggregateScope::Episode] {
        let scoped: Vec<&EventRow> = rows
            .iter()
            .filter(|row| scope.matches(row.media_type))
            .collect();
        if scoped.is_empty() {
            continue;
        }

        let events_count = scoped.len() as u64;
        let unique_titles: HashSet<&str> =
            scoped.iter().map(|row| row.title_key.as_str()).collect();
        let minutes: f64 = scoped.iter().map(|row| row.runtime_min).sum();
        let rewatch_events_count = scoped.iter().filter(|row| row.is_rewatch).count() as u64;

        outputs.push(DailyAggregate {
            day_start_utc,
            scope,
            events_count,
            unique_titles_count: unique_titles.len() as u64,
            watch_minutes_total: round2(minutes),
            rewatch_events_count,
            first_watch_events_count: events_count - rewatch_events_count,
        });
    }

    outputs
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(history_id: i64, media_type: MediaType, title_key: &str, runtime: f64, rewatch: bool) -> EventRow {
        EventRow {
            history_id,
            watched_at: Utc.with_ymd_and_hms(2024, 4, 2, 20, 0, 0).unwrap(),
            media_type,
            title_key: title_key.to_string(),
            runtime_min: runtime,
            is_rewatch: rewatch,
        }
    }

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn builds_all_three_scopes() {
        let rows = vec![
            row(1, MediaType::Movie, "movie:1", 120.0, false),
            row(2, MediaType::Episode, "episode:9:s1:e1", 45.0, true),
            row(3, MediaType::Episode, "episode:9:s1:e1", 45.0, false),
        ];
        let aggregates = build_daily_aggregates(&rows, day_start());
        assert_eq!(aggregates.len(), 3);

        let all = &aggregates[0];
        assert_eq!(all.scope, AggregateScope::All);
        assert_eq!(all.events_count, 3);
        assert_eq!(all.unique_titles_count, 2);
        assert_eq!(all.watch_minutes_total, 210.0);
        assert_eq!(all.rewatch_events_count, 1);
        assert_eq!(all.first_watch_events_count, 2);

        let episode = &aggregates[2];
        assert_eq!(episode.scope, AggregateScope::Episode);
        assert_eq!(episode.events_count, 2);
        assert_eq!(episode.unique_titles_count, 1);
    }

    #[test]
    fn omits_empty_scopes() {
        let rows = vec![row(1, MediaType::Movie, "movie:1", 90.0, false)];
        let aggregates = build_daily_aggregates(&rows, day_start());
        let scopes: Vec<AggregateScope> = aggregates.iter().map(|a| a.scope).collect();
        assert_eq!(scopes, vec![AggregateScope::All, AggregateScope::Movie]);
    }

    #[test]
    fn no_rows_no_aggregates() {
        assert!(build_daily_aggregates(&[], day_start()).is_empty());
    }

    #[test]
    fn minutes_round_to_two_decimals() {
        let rows = vec![
            row(1, MediaType::Movie, "movie:1", 10.333, false),
            row(2, MediaType::Movie, "movie:2", 20.333, false),
        ];
        let aggregates = build_daily_aggregates(&rows, day_start());
        assert_eq!(aggregates[0].watch_minutes_total, 30.67);
    }
}
