pub mod aggregate;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod sink;
pub mod sync;

pub use aggregate::{build_daily_aggregates, AggregateScope, DailyAggregate};
pub use error::EngineError;
pub use ledger::{Ledger, LedgerError};
pub use progress::{NoopObserver, SyncObserver};
pub use sink::{NoopSink, Sink, SinkError};
pub use sync::{EngineOptions, JobKind, JobStatus, SyncEngine, SyncStats};
