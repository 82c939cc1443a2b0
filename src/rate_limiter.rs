// =============================================================================
// Rate Limiter — process-wide token bucket gating outbound HTTP calls
// =============================================================================
//
// Tokens are a real-valued deficit, refilled lazily on every `acquire` call
// by `(now - last) * rate / 1000`, capped at `capacity`. A single process-wide
// instance is shared by all concurrent callers; mutations to the bucket are
// serialised behind a tokio mutex so that concurrent callers queue fairly
// instead of racing a compare-and-swap on a float.
// =============================================================================

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::FetchErrorKind;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter. `capacity` tokens max, refilled at `rate`
/// tokens/second. `acquire` blocks (cooperatively, honoring cancellation)
/// until a token is available, then consumes exactly one.
pub struct RateLimiter {
    capacity: f64,
    rate_per_sec: f64,
    bucket: tokio::sync::Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        debug!(capacity, rate_per_sec, "rate limiter initialised");
        Self {
            capacity,
            rate_per_sec,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire one token, sleeping as needed. Returns `Aborted` if `cancel`
    /// fires while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), FetchErrorKind> {
        loop {
            let wait_ms = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    trace!(remaining = bucket.tokens, "token acquired");
                    return Ok(());
                }

                let deficit = 1.0 - bucket.tokens;
                ((deficit * 1000.0 / self.rate_per_sec).ceil() as u64).max(1)
            };

            trace!(wait_ms, "rate limiter sleeping for a token");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchErrorKind::Aborted),
                _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms)) => {}
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        let refilled = elapsed_ms * self.rate_per_sec / 1000.0;
        if refilled > 0.0 {
            bucket.tokens = (bucket.tokens + refilled).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    /// Current token count, for observability only — not safe to act on
    /// without re-acquiring (another caller may drain it immediately after).
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_drains_burst_capacity_without_sleeping() {
        let limiter = RateLimiter::new(3.0, 1.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
        // Three tokens from a capacity-3 bucket should not require a sleep.
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn acquire_blocks_once_bucket_is_empty() {
        let limiter = RateLimiter::new(1.0, 20.0);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        // At 20 tokens/sec, the second token costs ~50ms.
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn acquire_aborts_on_cancellation_while_sleeping() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1.0));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let cancel2 = cancel.clone();
        let limiter2 = limiter.clone();
        let handle = tokio::spawn(async move { limiter2.acquire(&cancel2).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err(), FetchErrorKind::Aborted);
    }

    #[tokio::test]
    async fn fairness_bound_over_a_window() {
        // Over any window of length T >= 1s, calls should stay <= C + ceil(R*T).
        let capacity = 5.0;
        let rate = 10.0;
        let limiter = RateLimiter::new(capacity, rate);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let mut count = 0u32;
        while start.elapsed() < std::time::Duration::from_secs(1) {
            limiter.acquire(&cancel).await.unwrap();
            count += 1;
        }
        let t = start.elapsed().as_secs_f64();
        let bound = capacity + (rate * t).ceil();
        assert!(count as f64 <= bound + 1.0, "count={count} bound={bound}");
    }
}
