//! Capability-provider failures with retry classification.
//!
//! Distinguishes between transient failures (a retry may succeed) and
//! permanent failures (a retry will not help).

use std::time::Duration;

/// Failure reported by a capability provider.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ProviderFailure {
    /// The kind of failure
    pub kind: FailureKind,
    /// Human-readable reason
    pub reason: String,
    /// Suggested retry delay (from a Retry-After header or similar)
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Create a rate limit failure.
    pub fn rate_limited(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            reason: reason.into(),
            retry_after,
        }
    }

    /// Create a timeout failure.
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, reason)
    }

    /// Create a failure for an unreachable or overloaded provider.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, reason)
    }

    /// Create a failure for a request the provider refused as malformed.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedRequest, reason)
    }

    /// Create a failure the provider reported as unrecoverable.
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Unrecoverable, reason)
    }

    /// Create a failure for an abandoned call.
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "call abandoned after cancellation")
    }

    /// Shorthand for a generic transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::unavailable(reason)
    }

    /// Shorthand for a generic permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::unrecoverable(reason)
    }

    /// Set the suggested retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Check if this failure is transient and may be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns `retry_after` if set, otherwise `base * 2^(attempt - 1)` capped at `cap`.
    /// Rate limits start from twice the base delay.
    pub fn suggested_delay(&self, base: Duration, cap: Duration, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after.min(cap);
        }

        let base = match self.kind {
            FailureKind::RateLimited => base.saturating_mul(2),
            _ => base,
        };

        backoff_delay(base, cap, attempt)
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `cap`.
///
/// `attempt` is 1-based; attempt 0 is treated like attempt 1.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let multiplier = 2u32.saturating_pow(exponent);
    base.saturating_mul(multiplier).min(cap)
}

/// Classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limited - transient, retry with backoff
    RateLimited,
    /// Call exceeded its deadline - transient
    Timeout,
    /// Provider unreachable or overloaded - transient
    Unavailable,
    /// Request rejected as malformed - permanent
    MalformedRequest,
    /// Provider reported an unrecoverable error - permanent
    Unrecoverable,
    /// Call abandoned because the node was cancelled - never retried
    Cancelled,
}

impl FailureKind {
    /// Check if this failure kind is transient (a retry may succeed).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Unavailable
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::RateLimited => write!(f, "Rate limited"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Unavailable => write!(f, "Provider unavailable"),
            FailureKind::MalformedRequest => write!(f, "Malformed request"),
            FailureKind::Unrecoverable => write!(f, "Unrecoverable provider error"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Map an HTTP status code onto a failure kind.
///
/// For hosts that wrap HTTP APIs as capability providers.
pub fn classify_http_status(status: u16) -> FailureKind {
    match status {
        408 => FailureKind::Timeout,
        429 => FailureKind::RateLimited,
        500 | 502 | 503 | 504 => FailureKind::Unavailable,
        400 | 404 | 413 | 422 => FailureKind::MalformedRequest,
        400..=499 => FailureKind::Unrecoverable,
        _ => FailureKind::Unavailable,
    }
}
