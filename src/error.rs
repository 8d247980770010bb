use thiserror::Error;

/// Failure reported by a collaborator (session driver, extraction service,
/// ledger client). The variant decides how far the failure propagates.
#[derive(Debug, Error)]
pub enum StepError {
    /// Stale page state, timeouts, dropped connections. Retried.
    #[error("transient: {0}")]
    Transient(String),

    /// Quota exhausted or HTTP 429 from the extraction service.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The opened class does not belong to the expected course.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited(message.into())
    }

    pub fn identity_mismatch(message: impl Into<String>) -> Self {
        Self::IdentityMismatch(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}
