use thiserror::Error;

/// Errors surfaced by a remote history source. The retry loop inside the
/// client fully contains transient failures; a value of this type escaping a
/// call means retries were exhausted or the failure is not retryable.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connect/timeout/transport failure after retries.
    #[error("network error talking to the remote API: {0}")]
    Network(String),

    /// 429 persisted past the retry budget.
    #[error("remote API rate limited the request (last retry-after {retry_after_s}s)")]
    RateLimit { retry_after_s: f64 },

    /// 5xx persisted past the retry budget.
    #[error("remote API server error: status {status}")]
    Server { status: u16, detail: String },

    /// Any other 4xx. Never retried.
    #[error("remote API rejected the request: status {status}: {detail}")]
    Client { status: u16, detail: String },

    /// The token refresh grant was rejected (or no refresh token is held).
    /// Fatal to the whole process; the caller clears persisted credentials
    /// and re-bootstraps.
    #[error("token refresh was rejected; the refresh token is missing, invalid or revoked")]
    Authentication,

    /// The remote answered 2xx with a body we cannot make sense of.
    #[error("unexpected remote API response: {0}")]
    Protocol(String),
}

impl SourceError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, SourceError::Authentication)
    }
}
