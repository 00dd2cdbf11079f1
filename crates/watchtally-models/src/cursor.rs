use chrono::{DateTime, Utc};

/// Marks the latest successfully ingested event. Ordering is lexicographic:
/// later `watched_at` wins, equal instants tie-break on the larger
/// `history_id`. The persisted cursor only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub watched_at: DateTime<Utc>,
    pub history_id: i64,
}
