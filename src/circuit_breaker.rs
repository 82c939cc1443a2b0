// =============================================================================
// Circuit Breaker — classical three-state infra-failure breaker
// =============================================================================
//
// Closed: normal operation, tracks a consecutive infra-failure count.
// Open: every call fails immediately until the cooldown elapses.
// HalfOpen: exactly one probe call is admitted; success closes the breaker,
// failure re-opens it with a fresh `opened_at`.
//
// Error *classification* (infrastructure vs. business) is the caller's
// responsibility via `FetchErrorKind::is_infrastructure` — this breaker only
// tracks the state machine.
// =============================================================================

use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::FetchErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Whether a half-open probe is currently in flight (at most one).
    probe_in_flight: bool,
}

/// Observable snapshot of the breaker's current state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    threshold: u32,
    cooldown_ms: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            threshold,
            cooldown_ms,
        }
    }

    /// Call before issuing a request. Returns `Err(CircuitOpen)` without any
    /// network I/O if the breaker is open (and cooldown has not elapsed) or
    /// if a half-open probe is already in flight.
    pub fn admit(&self) -> Result<(), FetchErrorKind> {
        let mut inner = self.inner.write();

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("open state always has opened_at");
                if opened_at.elapsed().as_millis() as u64 >= self.cooldown_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker cooldown elapsed — admitting half-open probe");
                    Ok(())
                } else {
                    Err(FetchErrorKind::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(FetchErrorKind::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of a call admitted by `admit`. `is_infra` should
    /// come from `FetchErrorKind::is_infrastructure()` on failure.
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        if inner.state == BreakerState::HalfOpen {
            info!("half-open probe succeeded — closing circuit breaker");
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self, is_infra: bool) {
        let mut inner = self.inner.write();

        if inner.state == BreakerState::HalfOpen {
            warn!("half-open probe failed — re-opening circuit breaker");
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            inner.consecutive_failures = 0;
            return;
        }

        if !is_infra {
            // Business failures never trip the breaker.
            return;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold && inner.state == BreakerState::Closed {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                threshold = self.threshold,
                "circuit breaker tripped — opening"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.read();
        let cooldown_remaining_ms = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                let elapsed = opened_at.elapsed().as_millis() as u64;
                Some(self.cooldown_ms.saturating_sub(elapsed))
            }
            _ => None,
        };
        BreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_remaining_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_infra_failures() {
        let cb = CircuitBreaker::new(5, 30_000);
        for _ in 0..4 {
            cb.admit().unwrap();
            cb.record_failure(true);
        }
        assert_eq!(cb.status().state, BreakerState::Closed);

        cb.admit().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.status().state, BreakerState::Open);

        // Next call should fail fast without issuing a network request.
        assert_eq!(cb.admit().unwrap_err(), FetchErrorKind::CircuitOpen);
    }

    #[test]
    fn business_failures_never_trip_the_breaker() {
        let cb = CircuitBreaker::new(2, 30_000);
        for _ in 0..10 {
            cb.admit().unwrap();
            cb.record_failure(false);
        }
        assert_eq!(cb.status().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes_breaker() {
        let cb = CircuitBreaker::new(1, 0); // zero cooldown for the test
        cb.admit().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.status().state, BreakerState::Open);

        // Cooldown is zero, so the very next admit transitions to half-open.
        cb.admit().unwrap();
        assert_eq!(cb.status().state, BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.status().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens_breaker() {
        let cb = CircuitBreaker::new(1, 0);
        cb.admit().unwrap();
        cb.record_failure(true);
        cb.admit().unwrap();
        assert_eq!(cb.status().state, BreakerState::HalfOpen);
        cb.record_failure(true);
        assert_eq!(cb.status().state, BreakerState::Open);
    }

    #[test]
    fn only_one_half_open_probe_admitted_at_a_time() {
        let cb = CircuitBreaker::new(1, 0);
        cb.admit().unwrap();
        cb.record_failure(true);
        cb.admit().unwrap(); // first probe admitted, transitions to half-open
        assert_eq!(cb.admit().unwrap_err(), FetchErrorKind::CircuitOpen);
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let cb = CircuitBreaker::new(3, 30_000);
        cb.admit().unwrap();
        cb.record_failure(true);
        cb.admit().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.status().consecutive_failures, 2);

        cb.admit().unwrap();
        cb.record_success();
        assert_eq!(cb.status().consecutive_failures, 0);
    }
}
