use thiserror::Error;

/// Failure kinds surfaced by a provider adapter. Nothing else escapes an
/// adapter; callers branch on the kind to decide retry/fallback behavior.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Transport-class failure worth retrying (connect error, timeout, 5xx).
    #[error("transient: {0}")]
    Transient(String),

    /// Upstream asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Request is well-formed but the upstream rejected it for good
    /// (bad credentials, malformed symbol, contract violation).
    #[error("permanent: {0}")]
    Permanent(String),

    /// Adapter has no implementation for this capability.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Valid empty result.
    #[error("not found")]
    NotFound,
}

impl ProviderError {
    /// Whether the source router should advance to the next provider
    /// rather than surface this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_)
                | ProviderError::RateLimited(_)
                | ProviderError::Unsupported(_)
        )
    }

    /// Whether an in-adapter bounded retry is warranted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Whether this outcome should count as a failure in health metrics.
    /// `NotFound` and `Unsupported` are legitimate answers, not failures.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_)
                | ProviderError::RateLimited(_)
                | ProviderError::Permanent(_)
        )
    }
}

/// Errors from the document store. A conditional upsert that refuses a
/// stale write is not an error; it reports a skipped outcome instead.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query error: {0}")]
    Query(String),
}

/// Errors returned to analysis task submitters.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("quota-exceeded-concurrent: user has {current} unfinished tasks (limit {limit})")]
    QuotaExceededConcurrent { current: i64, limit: i64 },

    #[error("quota-exceeded-daily: user submitted {current} tasks today (limit {limit})")]
    QuotaExceededDaily { current: i64, limit: i64 },

    #[error("bad-request: {0}")]
    BadRequest(String),

    #[error("not-found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

impl QueueError {
    /// Stable machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::QuotaExceededConcurrent { .. } => "quota-exceeded-concurrent",
            QueueError::QuotaExceededDaily { .. } => "quota-exceeded-daily",
            QueueError::BadRequest(_) => "bad-request",
            QueueError::NotFound(_) => "not-found",
            QueueError::Store(_) => "store-unavailable",
            QueueError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_eligibility_matches_taxonomy() {
        assert!(ProviderError::Transient("timeout".into()).is_fallback_eligible());
        assert!(ProviderError::RateLimited("429".into()).is_fallback_eligible());
        assert!(ProviderError::Unsupported("get_news").is_fallback_eligible());
        assert!(!ProviderError::Permanent("bad token".into()).is_fallback_eligible());
        assert!(!ProviderError::NotFound.is_fallback_eligible());
    }

    #[test]
    fn not_found_is_not_a_health_failure() {
        assert!(!ProviderError::NotFound.counts_as_failure());
        assert!(!ProviderError::Unsupported("x").counts_as_failure());
        assert!(ProviderError::Transient("t".into()).counts_as_failure());
    }

    #[test]
    fn queue_error_codes_are_stable() {
        let e = QueueError::QuotaExceededConcurrent {
            current: 3,
            limit: 3,
        };
        assert_eq!(e.code(), "quota-exceeded-concurrent");
        let e = QueueError::QuotaExceededDaily {
            current: 1000,
            limit: 1000,
        };
        assert_eq!(e.code(), "quota-exceeded-daily");
    }
}
