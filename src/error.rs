// =============================================================================
// Error taxonomy — kinds detectable without string matching
// =============================================================================

use thiserror::Error;

/// Classification of an outbound call's failure. Every suspension point in
/// the fetcher, rate limiter, and fan-out surfaces one of these kinds so
/// callers can branch on the tag rather than on error message text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchErrorKind {
    /// Provider returned 429 or a rate-limit-shaped body; retries exhausted.
    #[error("rate limited")]
    RateLimited,

    /// A suspension point observed cancellation (stop request or timeout).
    #[error("aborted")]
    Aborted,

    /// The per-call or per-ticker timeout elapsed.
    #[error("timed out: {label}")]
    Timeout { label: String },

    /// The global kill-switch (`DATA_API_REQUESTS_PAUSED`) is set, or the
    /// API key is absent.
    #[error("requests paused")]
    Paused,

    /// Provider returned 403 with a subscription-tier-restriction body.
    #[error("subscription restricted")]
    SubscriptionRestricted,

    /// Non-2xx status not covered by a more specific kind.
    #[error("bad status: {0}")]
    BadStatus(u16),

    /// Body decoded but did not match any tolerated shape.
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// The circuit breaker is open; the call was never issued.
    #[error("circuit open")]
    CircuitOpen,

    /// Transport-level failure (DNS, connect, TLS, reset, ...).
    #[error("network error: {0}")]
    Network(String),
}

impl FetchErrorKind {
    /// Classification used by the circuit breaker: infrastructure
    /// failures count toward the trip threshold, business failures do not.
    /// A `BadStatus` only counts when it's a server-side (5xx) failure —
    /// ordinary 4xx responses are the provider telling us something about
    /// the request, not a sign the provider itself is unhealthy.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::Timeout { .. } | FetchErrorKind::Network(_)
        ) || matches!(self, FetchErrorKind::BadStatus(code) if *code >= 500)
    }

    /// Business failures: rate-limited, aborted, paused, subscription
    /// restricted — never trip the breaker.
    pub fn is_business(&self) -> bool {
        !self.is_infrastructure() && !matches!(self, FetchErrorKind::CircuitOpen)
    }

    /// Whether this failure should be counted as an error while the run is
    /// stopping.
    pub fn counts_while_stopping(&self) -> bool {
        !matches!(self, FetchErrorKind::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_infrastructure() {
        assert!(FetchErrorKind::BadStatus(500).is_infrastructure());
        assert!(FetchErrorKind::BadStatus(503).is_infrastructure());
        assert!(FetchErrorKind::Timeout { label: "x".to_string() }.is_infrastructure());
        assert!(FetchErrorKind::Network("reset".to_string()).is_infrastructure());
    }

    #[test]
    fn client_errors_are_business_not_infrastructure() {
        assert!(!FetchErrorKind::BadStatus(404).is_infrastructure());
        assert!(!FetchErrorKind::BadStatus(400).is_infrastructure());
        assert!(FetchErrorKind::BadStatus(404).is_business());
    }
}
