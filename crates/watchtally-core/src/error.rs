use thiserror::Error;

use crate::ledger::LedgerError;
use crate::sink::SinkError;
use watchtally_sources::SourceError;

/// The closed set of failures a sync job can surface. Per-record problems
/// (validation) never reach this level; they are dead-lettered inside the
/// window pass.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl EngineError {
    /// True when the stored refresh token was rejected and the process
    /// should clear it and exit for re-bootstrap.
    pub fn is_authentication(&self) -> bool {
        matches!(self, EngineError::Source(source) if source.is_authentication())
    }
}
