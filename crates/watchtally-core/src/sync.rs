use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregate::{build_daily_aggregates, DailyAggregate};
use crate::error::EngineError;
use crate::ledger::{Ledger, KEY_LAST_SUCCESSFUL_RUN};
use crate::progress::SyncObserver;
use crate::sink::Sink;
use watchtally_models::{normalize_history_record, Cursor, WatchEvent};
use watchtally_sources::{HistorySource, SyncWindow};

/// Ledger/sink inserts are committed in batches of this size, so a crash
/// mid-window loses at most one batch of progress and never the cursor.
const INSERT_BATCH_SIZE: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backfill,
    Incremental,
    Reconcile,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backfill => "backfill",
            JobKind::Incremental => "incremental",
            JobKind::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub job: JobKind,
    pub status: JobStatus,
    pub events_fetched: u64,
    pub events_inserted: u64,
    pub duplicates_skipped: u64,
    pub parse_errors: u64,
    pub events_deleted: u64,
    pub days_rewritten_raw: u64,
    pub duration_ms: u64,
}

impl SyncStats {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            status: JobStatus::Completed,
            events_fetched: 0,
            events_inserted: 0,
            duplicates_skipped: 0,
            parse_errors: 0,
            events_deleted: 0,
            days_rewritten_raw: 0,
            duration_ms: 0,
        }
    }

    fn skipped(job: JobKind) -> Self {
        Self {
            status: JobStatus::Skipped,
            ..Self::new(job)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Timezone used to bucket events into calendar days.
    pub timezone: Tz,
    /// Incremental windows start this far before the stored cursor, to pick
    /// up events the remote published late.
    pub overlap_hours: i64,
    /// Trailing window re-fetched in full by reconcile runs.
    pub reconcile_days: i64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            overlap_hours: 24,
            reconcile_days: 7,
        }
    }
}

struct WindowOutcome {
    stats: SyncStats,
    remote_ids: Option<BTreeSet<i64>>,
}

/// Drives one sync job at a time against a single ledger. Not safe for
/// concurrent invocation; the scheduler serializes jobs.
pub struct SyncEngine {
    source: Box<dyn HistorySource>,
    sink: Box<dyn Sink>,
    ledger: Ledger,
    observer: Box<dyn SyncObserver>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        source: Box<dyn HistorySource>,
        sink: Box<dyn Sink>,
        ledger: Ledger,
        observer: Box<dyn SyncObserver>,
        options: EngineOptions,
    ) -> Self {
        Self {
            source,
            sink,
            ledger,
            observer,
            options,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Full-history ingest. Skips when a previous backfill already completed,
    /// unless forced.
    pub async fn run_backfill(&mut self, force: bool) -> Result<SyncStats, EngineError> {
        if self.ledger.backfill_completed()? && !force {
            info!("backfill already completed, skipping");
            return Ok(SyncStats::skipped(JobKind::Backfill));
        }
        let result = self.backfill_inner().await;
        self.store_rotated_refresh_token();
        let stats = result?;
        self.observer.job_finished(&stats);
        Ok(stats)
    }

    async fn backfill_inner(&mut self) -> Result<SyncStats, EngineError> {
        let outcome = self
            .run_window(JobKind::Backfill, SyncWindow::default(), true, false)
            .await?;
        self.ledger.set_backfill_completed(true)?;
        Ok(outcome.stats)
    }

    /// Catches up from the stored cursor, re-reading `overlap_hours` of
    /// already-seen history so late-published events are not missed.
    pub async fn run_incremental(&mut self) -> Result<SyncStats, EngineError> {
        let start_at = self
            .ledger
            .cursor()?
            .map(|cursor| cursor.watched_at - Duration::hours(self.options.overlap_hours));
        if start_at.is_none() {
            debug!("no cursor yet, incremental run covers the full history");
        }
        let result = self
            .run_window(JobKind::Incremental, SyncWindow::from(start_at), true, false)
            .await;
        self.store_rotated_refresh_token();
        let stats = result?.stats;
        self.observer.job_finished(&stats);
        Ok(stats)
    }

    /// Re-fetches the trailing window in full and mirrors remote removals
    /// into the ledger and sink. Never advances the cursor.
    pub async fn run_reconcile(&mut self) -> Result<SyncStats, EngineError> {
        let result = self.reconcile_inner().await;
        self.store_rotated_refresh_token();
        let stats = result?;
        self.observer.job_finished(&stats);
        Ok(stats)
    }

    async fn reconcile_inner(&mut self) -> Result<SyncStats, EngineError> {
        let window_end = Utc::now();
        let window_start = window_end - Duration::days(self.options.reconcile_days);
        let outcome = self
            .run_window(
                JobKind::Reconcile,
                SyncWindow::between(window_start, window_end),
                false,
                true,
            )
            .await?;
        let mut stats = outcome.stats;
        let remote_ids = outcome.remote_ids.unwrap_or_default();

        if stats.parse_errors == 0 {
            let local_rows = self.ledger.fetch_rows_in_range(window_start, window_end)?;
            let local_ids: BTreeSet<i64> = local_rows.iter().map(|row| row.history_id).collect();
            let missing: BTreeSet<i64> = local_ids.difference(&remote_ids).copied().collect();

            if !missing.is_empty() {
                let removed = self.ledger.delete_by_ids(&missing)?;
                stats.events_deleted = removed.len() as u64;
                let touched: BTreeSet<NaiveDate> = removed
                    .iter()
                    .map(|row| self.local_day(row.watched_at))
                    .collect();
                info!(
                    deleted = stats.events_deleted,
                    days = touched.len(),
                    "removed events no longer present remotely"
                );
                for day in &touched {
                    let (start, end) = self.local_day_bounds(*day);
                    self.sink.delete_raw_events_range(start, end).await?;
                    let survivors = self.ledger.fetch_events_in_range(start, end)?;
                    self.sink.write_raw_events(&survivors).await?;
                }
                stats.days_rewritten_raw = touched.len() as u64;
            }
        } else {
            warn!(
                parse_errors = stats.parse_errors,
                "records in the reconcile window failed to parse, hard-delete detection skipped for this pass"
            );
        }

        // The whole trailing window gets fresh aggregates, not just the days
        // the deletions touched, so an interrupted earlier pass cannot leave
        // stale rollups behind.
        let mut days = BTreeSet::new();
        let mut day = self.local_day(window_start);
        let last_day = self.local_day(window_end);
        while day <= last_day {
            days.insert(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        self.rebuild_days(&days).await?;

        Ok(stats)
    }

    async fn run_window(
        &mut self,
        job: JobKind,
        window: SyncWindow,
        update_cursor: bool,
        collect_remote_ids: bool,
    ) -> Result<WindowOutcome, EngineError> {
        let started = Instant::now();
        info!(%job, start_at = ?window.start_at, end_at = ?window.end_at, "starting sync window");
        self.observer.job_started(job);

        let mut stats = SyncStats::new(job);
        let mut batch: Vec<WatchEvent> = Vec::with_capacity(INSERT_BATCH_SIZE);
        let mut affected_days: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut remote_ids = collect_remote_ids.then(BTreeSet::new);
        let mut cursor_candidate: Option<Cursor> = None;

        let mut page = 1u32;
        loop {
            let history = self.source.history_page(&window, page).await?;
            if history.records.is_empty() {
                break;
            }
            self.observer
                .page_loaded(job, page, history.page_count, history.item_count);

            for record in &history.records {
                stats.events_fetched += 1;
                let event = match normalize_history_record(record) {
                    Ok(event) => event,
                    Err(error) => {
                        stats.parse_errors += 1;
                        let history_id = record.get("id").and_then(Value::as_i64);
                        warn!(?history_id, %error, "record failed normalization, dead-lettered");
                        self.ledger
                            .record_dead_letter(history_id, record, &error.to_string())?;
                        continue;
                    }
                };

                if let Some(ids) = remote_ids.as_mut() {
                    ids.insert(event.history_id);
                }

                let candidate = event.cursor();
                if cursor_candidate.map_or(true, |current| candidate > current) {
                    cursor_candidate = Some(candidate);
                }

                if self.ledger.has_seen(event.history_id)? {
                    stats.duplicates_skipped += 1;
                    continue;
                }

                affected_days.insert(self.local_day(event.watched_at));
                batch.push(event);
                if batch.len() >= INSERT_BATCH_SIZE {
                    self.flush_batch(&mut batch, &mut stats).await?;
                }
            }

            if history.last {
                break;
            }
            page += 1;
        }

        self.flush_batch(&mut batch, &mut stats).await?;

        if !affected_days.is_empty() {
            self.rebuild_days(&affected_days).await?;
        }

        if update_cursor {
            if let Some(candidate) = cursor_candidate {
                let advance = match self.ledger.cursor()? {
                    Some(current) => candidate > current,
                    None => true,
                };
                if advance {
                    self.ledger.set_cursor(candidate)?;
                    debug!(watched_at = %candidate.watched_at, history_id = candidate.history_id, "cursor advanced");
                }
            }
        }

        self.ledger.set_state(
            KEY_LAST_SUCCESSFUL_RUN,
            &Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )?;

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            %job,
            fetched = stats.events_fetched,
            inserted = stats.events_inserted,
            duplicates = stats.duplicates_skipped,
            parse_errors = stats.parse_errors,
            duration_ms = stats.duration_ms,
            "sync window finished"
        );

        Ok(WindowOutcome { stats, remote_ids })
    }

    /// Sink first, ledger second: a crash in between leaves rows the sink
    /// already holds but the ledger does not, and the next run re-inserts
    /// them idempotently. The reverse order could drop events for good.
    async fn flush_batch(
        &mut self,
        batch: &mut Vec<WatchEvent>,
        stats: &mut SyncStats,
    ) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.sink.write_raw_events(batch).await?;
        self.ledger.mark_seen_many(batch)?;
        stats.events_inserted += batch.len() as u64;
        batch.clear();
        Ok(())
    }

    async fn rebuild_days(&mut self, days: &BTreeSet<NaiveDate>) -> Result<(), EngineError> {
        let mut aggregates: Vec<DailyAggregate> = Vec::new();
        for day in days {
            let (start, end) = self.local_day_bounds(*day);
            let rows = self.ledger.fetch_rows_in_range(start, end)?;
            aggregates.extend(build_daily_aggregates(&rows, start));
        }
        if aggregates.is_empty() {
            return Ok(());
        }
        debug!(days = days.len(), aggregates = aggregates.len(), "rebuilding daily aggregates");
        self.sink.write_daily_aggregates(&aggregates).await?;
        Ok(())
    }

    fn local_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.options.timezone).date_naive()
    }

    /// UTC instants of local midnight for `day` and the following day. A
    /// midnight made ambiguous by a DST fold resolves to the earlier instant;
    /// a midnight skipped by a DST gap falls back to the naive time read as
    /// UTC.
    fn local_day_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.local_midnight_utc(day);
        let end = match day.succ_opt() {
            Some(next) => self.local_midnight_utc(next),
            None => start + Duration::days(1),
        };
        (start, end)
    }

    fn local_midnight_utc(&self, day: NaiveDate) -> DateTime<Utc> {
        let naive = day.and_time(NaiveTime::MIN);
        match self.options.timezone.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        }
    }

    /// The remote may rotate the refresh token on any request; losing the
    /// rotated value would strand the stored credentials, so it is persisted
    /// after every job, successful or not.
    fn store_rotated_refresh_token(&mut self) {
        if let Some(token) = self.source.current_refresh_token() {
            if let Err(error) = self.ledger.set_refresh_token(&token) {
                warn!(%error, "could not persist rotated refresh token");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    use crate::aggregate::DailyAggregate;
    use crate::progress::NoopObserver;
    use crate::sink::SinkError;
    use watchtally_models::MediaType;
    use watchtally_sources::{HistoryPage, SourceError};

    struct FakeSource {
        pages: Vec<Vec<serde_json::Value>>,
        windows: Arc<Mutex<Vec<SyncWindow>>>,
    }

    impl FakeSource {
        fn new(pages: Vec<Vec<serde_json::Value>>) -> Self {
            Self {
                pages,
                windows: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl HistorySource for FakeSource {
        async fn history_page(
            &mut self,
            window: &SyncWindow,
            page: u32,
        ) -> Result<HistoryPage, SourceError> {
            if page == 1 {
                self.windows.lock().unwrap().push(window.clone());
            }
            let index = (page - 1) as usize;
            let records = self.pages.get(index).cloned().unwrap_or_default();
            let last = index + 1 >= self.pages.len();
            Ok(HistoryPage {
                records,
                page_count: Some(self.pages.len() as u32),
                item_count: None,
                last,
            })
        }

        fn current_refresh_token(&self) -> Option<String> {
            Some("rotated-token".to_string())
        }
    }

    #[derive(Debug)]
    enum SinkOp {
        RawWrite(Vec<i64>),
        AggregateWrite(Vec<DailyAggregate>),
        DeleteRange(DateTime<Utc>, DateTime<Utc>),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        ops: Arc<Mutex<Vec<SinkOp>>>,
    }

    impl RecordingSink {
        fn raw_write_sizes(&self) -> Vec<usize> {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .filter_map(|op| match op {
                    SinkOp::RawWrite(ids) => Some(ids.len()),
                    _ => None,
                })
                .collect()
        }

        fn delete_count(&self) -> usize {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .filter(|op| matches!(op, SinkOp::DeleteRange(_, _)))
                .count()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write_raw_events(&self, events: &[WatchEvent]) -> Result<(), SinkError> {
            self.ops.lock().unwrap().push(SinkOp::RawWrite(
                events.iter().map(|e| e.history_id).collect(),
            ));
            Ok(())
        }

        async fn write_daily_aggregates(
            &self,
            aggregates: &[DailyAggregate],
        ) -> Result<(), SinkError> {
            self.ops
                .lock()
                .unwrap()
                .push(SinkOp::AggregateWrite(aggregates.to_vec()));
            Ok(())
        }

        async fn delete_raw_events_range(
            &self,
            start_inclusive: DateTime<Utc>,
            end_exclusive: DateTime<Utc>,
        ) -> Result<(), SinkError> {
            self.ops
                .lock()
                .unwrap()
                .push(SinkOp::DeleteRange(start_inclusive, end_exclusive));
            Ok(())
        }
    }

    fn movie_record(id: i64, watched_at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "watched_at": watched_at,
            "type": "movie",
            "movie": {
                "title": format!("Movie {id}"),
                "year": 2020,
                "runtime": 100,
                "ids": { "trakt": 5000 + id }
            }
        })
    }

    fn engine(pages: Vec<Vec<serde_json::Value>>, sink: RecordingSink) -> SyncEngine {
        SyncEngine::new(
            Box::new(FakeSource::new(pages)),
            Box::new(sink),
            Ledger::open_in_memory().unwrap(),
            Box::new(NoopObserver),
            EngineOptions::default(),
        )
    }

    fn seeded_event(history_id: i64, watched_at: DateTime<Utc>) -> WatchEvent {
        WatchEvent {
            history_id,
            watched_at,
            media_type: MediaType::Movie,
            trakt_id: 5000 + history_id,
            show_trakt_id: None,
            season_number: None,
            episode_number: None,
            runtime_min: 100.0,
            year: Some(2020),
            title: format!("Movie {history_id}"),
            show_title: None,
            is_rewatch: false,
        }
    }

    #[tokio::test]
    async fn backfill_ingests_and_advances_cursor() {
        let sink = RecordingSink::default();
        let mut engine = engine(
            vec![
                vec![
                    movie_record(1, "2024-04-01T10:00:00Z"),
                    movie_record(2, "2024-04-01T12:00:00Z"),
                ],
                vec![movie_record(3, "2024-04-02T09:00:00Z")],
            ],
            sink.clone(),
        );

        let stats = engine.run_backfill(false).await.unwrap();
        assert_eq!(stats.status, JobStatus::Completed);
        assert_eq!(stats.events_fetched, 3);
        assert_eq!(stats.events_inserted, 3);
        assert_eq!(stats.duplicates_skipped, 0);

        let cursor = engine.ledger().cursor().unwrap().unwrap();
        assert_eq!(cursor.history_id, 3);
        assert_eq!(
            cursor.watched_at,
            Utc.with_ymd_and_hms(2024, 4, 2, 9, 0, 0).unwrap()
        );

        assert_eq!(sink.raw_write_sizes(), vec![3]);
        assert_eq!(
            engine.ledger().refresh_token().unwrap().as_deref(),
            Some("rotated-token")
        );

        let again = engine.run_backfill(false).await.unwrap();
        assert_eq!(again.status, JobStatus::Skipped);
    }

    #[tokio::test]
    async fn rerunning_over_ingested_data_only_counts_duplicates() {
        let pages = vec![vec![
            movie_record(1, "2024-04-01T10:00:00Z"),
            movie_record(2, "2024-04-01T12:00:00Z"),
        ]];
        let sink = RecordingSink::default();
        let mut engine = engine(pages, sink);

        engine.run_backfill(false).await.unwrap();
        let stats = engine.run_backfill(true).await.unwrap();
        assert_eq!(stats.events_fetched, 2);
        assert_eq!(stats.duplicates_skipped, 2);
        assert_eq!(stats.events_inserted, 0);
    }

    #[tokio::test]
    async fn cursor_never_decreases() {
        let sink = RecordingSink::default();
        let mut engine = engine(vec![vec![movie_record(1, "2024-04-01T10:00:00Z")]], sink);
        let high = Cursor {
            watched_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            history_id: 99,
        };
        engine.ledger().set_cursor(high).unwrap();

        engine.run_incremental().await.unwrap();
        assert_eq!(engine.ledger().cursor().unwrap(), Some(high));
    }

    #[tokio::test]
    async fn incremental_window_starts_overlap_before_cursor() {
        let sink = RecordingSink::default();
        let source = FakeSource::new(vec![vec![]]);
        let windows = source.windows.clone();
        let mut engine = SyncEngine::new(
            Box::new(source),
            Box::new(sink),
            Ledger::open_in_memory().unwrap(),
            Box::new(NoopObserver),
            EngineOptions::default(),
        );
        let cursor = Cursor {
            watched_at: Utc.with_ymd_and_hms(2024, 4, 10, 12, 0, 0).unwrap(),
            history_id: 7,
        };
        engine.ledger().set_cursor(cursor).unwrap();

        engine.run_incremental().await.unwrap();
        let seen = windows.lock().unwrap();
        assert_eq!(
            seen[0].start_at,
            Some(Utc.with_ymd_and_hms(2024, 4, 9, 12, 0, 0).unwrap())
        );
        assert_eq!(seen[0].end_at, None);
    }

    #[tokio::test]
    async fn large_windows_flush_in_batches() {
        let records: Vec<serde_json::Value> = (1..=600)
            .map(|id| movie_record(id, "2024-04-01T10:00:00Z"))
            .collect();
        let sink = RecordingSink::default();
        let mut engine = engine(vec![records], sink.clone());

        let stats = engine.run_backfill(false).await.unwrap();
        assert_eq!(stats.events_inserted, 600);
        assert_eq!(sink.raw_write_sizes(), vec![250, 250, 100]);
    }

    #[tokio::test]
    async fn malformed_records_are_dead_lettered_not_inserted() {
        let mut bad = movie_record(9, "2024-04-01T10:00:00Z");
        bad.as_object_mut().unwrap().remove("watched_at");
        let sink = RecordingSink::default();
        let mut engine = engine(
            vec![vec![movie_record(1, "2024-04-01T10:00:00Z"), bad]],
            sink,
        );

        let stats = engine.run_backfill(false).await.unwrap();
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.events_inserted, 1);
        assert!(!engine.ledger().has_seen(9).unwrap());
        assert_eq!(engine.ledger().dead_letter_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn reconcile_deletes_locally_held_events_absent_remotely() {
        let kept_at = Utc::now() - Duration::hours(26);
        let removed_at = Utc::now() - Duration::hours(25);
        let kept_iso = kept_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let sink = RecordingSink::default();
        let mut engine = engine(vec![vec![movie_record(100, &kept_iso)]], sink.clone());
        {
            let events = vec![seeded_event(100, kept_at), seeded_event(101, removed_at)];
            // direct seed, bypassing the sync path
            let ledger = &mut engine.ledger;
            ledger.mark_seen_many(&events).unwrap();
        }

        let stats = engine.run_reconcile().await.unwrap();
        assert_eq!(stats.events_deleted, 1);
        assert_eq!(stats.days_rewritten_raw, 1);
        assert!(engine.ledger().has_seen(100).unwrap());
        assert!(!engine.ledger().has_seen(101).unwrap());
        // cursor untouched by reconcile
        assert!(engine.ledger().cursor().unwrap().is_none());

        // the touched day is deleted in the sink, then rewritten from the
        // corrected ledger
        let ops = sink.ops.lock().unwrap();
        let delete_pos = ops
            .iter()
            .position(|op| matches!(op, SinkOp::DeleteRange(_, _)))
            .unwrap();
        let rewrite = ops[delete_pos + 1..]
            .iter()
            .find_map(|op| match op {
                SinkOp::RawWrite(ids) => Some(ids.clone()),
                _ => None,
            });
        if let Some(SinkOp::DeleteRange(start, end)) = ops.get(delete_pos) {
            assert!(*start <= removed_at && removed_at < *end);
        }
        let expected = if engine.local_day(kept_at) == engine.local_day(removed_at) {
            vec![100]
        } else {
            Vec::new()
        };
        assert_eq!(rewrite.unwrap(), expected);
    }

    #[tokio::test]
    async fn reconcile_skips_deletes_when_records_fail_to_parse() {
        let kept_at = Utc::now() - Duration::hours(26);
        let removed_at = Utc::now() - Duration::hours(25);
        let kept_iso = kept_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let mut bad = movie_record(9, &kept_iso);
        bad.as_object_mut().unwrap().remove("id");

        let sink = RecordingSink::default();
        let mut engine = engine(vec![vec![movie_record(100, &kept_iso), bad]], sink.clone());
        engine
            .ledger
            .mark_seen_many(&[seeded_event(100, kept_at), seeded_event(101, removed_at)])
            .unwrap();

        let stats = engine.run_reconcile().await.unwrap();
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.events_deleted, 0);
        assert!(engine.ledger().has_seen(101).unwrap());
        assert_eq!(sink.delete_count(), 0);
    }

    #[tokio::test]
    async fn aggregates_are_rebuilt_for_affected_days() {
        let sink = RecordingSink::default();
        let mut engine = engine(
            vec![vec![
                movie_record(1, "2024-04-01T10:00:00Z"),
                movie_record(2, "2024-04-02T10:00:00Z"),
            ]],
            sink.clone(),
        );

        engine.run_backfill(false).await.unwrap();

        let ops = sink.ops.lock().unwrap();
        let aggregates = ops
            .iter()
            .find_map(|op| match op {
                SinkOp::AggregateWrite(aggs) => Some(aggs.clone()),
                _ => None,
            })
            .unwrap();
        // two days, each with scopes "all" and "movie"
        assert_eq!(aggregates.len(), 4);
        assert_eq!(
            aggregates[0].day_start_utc,
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
        );
    }
}
