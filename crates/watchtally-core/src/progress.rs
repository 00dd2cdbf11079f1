use crate::sync::{JobKind, SyncStats};

/// Observability hook for a running job. Purely informational: nothing the
/// engine does depends on what an observer implementation does.
pub trait SyncObserver: Send {
    fn job_started(&mut self, _job: JobKind) {}

    fn page_loaded(
        &mut self,
        _job: JobKind,
        _page: u32,
        _page_count: Option<u32>,
        _item_count: Option<u64>,
    ) {
    }

    fn job_finished(&mut self, _stats: &SyncStats) {}
}

pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
