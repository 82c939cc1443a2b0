// =============================================================================
// Stall Watchdog — per-attempt progress monitor
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const CHECK_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);

/// One watchdog is created per fan-out attempt. `mark_progress` is called by
/// the orchestrator's `on_settled` hook; if no progress is observed for
/// `stall_timeout`, the watchdog fires `cancel` exactly once and records
/// itself as stalled so the orchestrator can distinguish a stall-origin
/// cancellation from an operator stop/pause.
pub struct StallWatchdog {
    last_progress_ms: Arc<AtomicI64>,
    stalled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    started_at: Instant,
}

impl StallWatchdog {
    pub fn spawn(cancel: CancellationToken) -> Self {
        Self::spawn_with_timeout(cancel, DEFAULT_STALL_TIMEOUT)
    }

    pub fn spawn_with_timeout(cancel: CancellationToken, stall_timeout: Duration) -> Self {
        let started_at = Instant::now();
        let last_progress_ms = Arc::new(AtomicI64::new(0));
        let stalled = Arc::new(AtomicBool::new(false));

        let last_progress_for_task = last_progress_ms.clone();
        let stalled_for_task = stalled.clone();
        let cancel_for_task = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => break,
                    _ = interval.tick() => {
                        let elapsed_since_progress = Duration::from_millis(
                            (started_at.elapsed().as_millis() as i64
                                - last_progress_for_task.load(Ordering::SeqCst))
                                .max(0) as u64,
                        );
                        if elapsed_since_progress >= stall_timeout {
                            warn!(
                                elapsed_secs = elapsed_since_progress.as_secs(),
                                "stall watchdog tripped — aborting attempt"
                            );
                            stalled_for_task.store(true, Ordering::SeqCst);
                            cancel_for_task.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Self {
            last_progress_ms,
            stalled,
            handle,
            started_at,
        }
    }

    /// Refresh the last-progress timestamp. Call this from the fan-out's
    /// `on_settled` hook.
    pub fn mark_progress(&self) {
        self.last_progress_ms
            .store(self.started_at.elapsed().as_millis() as i64, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Stop the watchdog's background task without firing cancellation
    /// (the attempt ended normally). Takes `&self` (not ownership) so a
    /// watchdog shared via `Arc` across worker closures can still be
    /// stopped once the run that spawned it finishes.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// Exponential backoff schedule for stall retries: base 5 s, capped at 60 s.
pub fn stall_backoff(retry_count: u32) -> Duration {
    let base_ms = 5_000u64;
    let cap_ms = 60_000u64;
    Duration::from_millis((base_ms * 2u64.pow(retry_count.min(10))).min(cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_progress_prevents_a_stall_trip() {
        let cancel = CancellationToken::new();
        let watchdog = StallWatchdog::spawn_with_timeout(cancel.clone(), Duration::from_millis(200));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            watchdog.mark_progress();
        }

        assert!(!watchdog.is_stalled());
        assert!(!cancel.is_cancelled());
        watchdog.stop();
    }

    #[tokio::test]
    async fn no_progress_trips_the_watchdog_and_cancels() {
        let cancel = CancellationToken::new();
        let watchdog = StallWatchdog::spawn_with_timeout(cancel.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(watchdog.is_stalled());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn stall_backoff_grows_exponentially_and_caps() {
        assert_eq!(stall_backoff(0), Duration::from_millis(5_000));
        assert_eq!(stall_backoff(1), Duration::from_millis(10_000));
        assert_eq!(stall_backoff(2), Duration::from_millis(20_000));
        assert_eq!(stall_backoff(10), Duration::from_millis(60_000));
    }
}
