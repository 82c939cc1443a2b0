// =============================================================================
// Retry Passes — two reduced-concurrency replays over main-pass failures
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::FetchErrorKind;
use crate::fanout::{map_with_concurrency, Settled};

/// Run exactly two retry passes over `failed_items`. Pass 1 runs at
/// `max(1, base_concurrency / 2)`; pass 2 at `base_concurrency / 4` (0 skips
/// the pass entirely, per `map_with_concurrency`'s `len==0` behaviour).
/// Returns the items still failing after both passes.
///
/// `on_recovered`/`on_still_failed` are invoked once per item as each pass
/// settles; recoveries stop being retried in the next pass. `on_progress` is
/// invoked on every settle regardless of outcome — wire it to a
/// [`crate::watchdog::StallWatchdog`]'s `mark_progress` so a stall spanning
/// both passes is still detectable.
#[allow(clippy::too_many_arguments)]
pub async fn run_retry_passes<T, I, W, Fut, S, OnRecovered, OnStillFailed, OnProgress>(
    failed_items: Vec<I>,
    base_concurrency: usize,
    worker: W,
    on_recovered: OnRecovered,
    on_still_failed: OnStillFailed,
    on_progress: OnProgress,
    should_stop: S,
    cancel: CancellationToken,
) -> Vec<I>
where
    I: Clone + Send + Sync + 'static,
    T: Send + 'static,
    W: Fn(I, usize, CancellationToken) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<T, FetchErrorKind>> + Send,
    S: Fn() -> bool + Send + Sync + Clone + 'static,
    OnRecovered: Fn(&I) + Send + Sync + Clone + 'static,
    OnStillFailed: Fn(&I, &FetchErrorKind) + Send + Sync + Clone + 'static,
    OnProgress: Fn() + Send + Sync + Clone + 'static,
{
    let passes = [
        ("pass-1", (base_concurrency / 2).max(1)),
        ("pass-2", base_concurrency / 4),
    ];

    let mut remaining = failed_items;

    for (label, concurrency) in passes {
        if remaining.is_empty() || should_stop() {
            break;
        }
        if cancel.is_cancelled() {
            break;
        }

        info!(
            pass = label,
            concurrency,
            count = remaining.len(),
            "starting retry pass"
        );

        let worker = worker.clone();
        let on_recovered = on_recovered.clone();
        let on_still_failed = on_still_failed.clone();
        let on_progress = on_progress.clone();

        let items = remaining.clone();
        let results = map_with_concurrency(
            items.clone(),
            concurrency,
            worker,
            move |_settled: &Settled<T>, _idx, _item: &I| on_progress(),
            should_stop.clone(),
            cancel.clone(),
        )
        .await;

        let mut next_remaining = Vec::new();
        for (item, settled) in items.into_iter().zip(results.into_iter()) {
            match settled {
                Settled::Ok(_) => on_recovered(&item),
                Settled::Err(kind) => {
                    if kind == FetchErrorKind::Aborted && should_stop() {
                        // Aborted while stopping is not counted as a new
                        // failure — drop it from the still-failed set.
                        continue;
                    }
                    on_still_failed(&item, &kind);
                    next_remaining.push(item);
                }
            }
        }
        remaining = next_remaining;
    }

    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn recovers_items_that_succeed_on_first_retry_pass() {
        let cancel = CancellationToken::new();
        let recovered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let still_failed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let recovered_clone = recovered.clone();
        let still_failed_clone = still_failed.clone();

        let remaining = run_retry_passes::<u32, u32, _, _, _, _, _, _>(
            vec![1, 2, 3],
            8,
            |item, _idx, _cancel| async move {
                if item == 2 {
                    Err(FetchErrorKind::BadStatus(500))
                } else {
                    Ok(item)
                }
            },
            move |item: &u32| recovered_clone.lock().unwrap().push(*item),
            move |item: &u32, _kind| still_failed_clone.lock().unwrap().push(*item),
            || {},
            || false,
            cancel,
        )
        .await;

        assert_eq!(remaining, vec![2]);
        assert_eq!(*recovered.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn runs_exactly_two_passes_when_failures_persist() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let remaining = run_retry_passes::<u32, u32, _, _, _, _, _, _>(
            vec![42],
            8,
            move |item, _idx, _cancel| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(FetchErrorKind::BadStatus(500))
                }
            },
            |_item: &u32| {},
            |_item: &u32, _kind| {},
            || {},
            || false,
            cancel,
        )
        .await;

        assert_eq!(remaining, vec![42]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn on_progress_fires_once_per_settle_across_both_passes() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let ticks_clone = ticks.clone();

        let _remaining = run_retry_passes::<u32, u32, _, _, _, _, _, _>(
            vec![1, 2],
            8,
            |_item, _idx, _cancel| async move { Err::<u32, _>(FetchErrorKind::BadStatus(500)) },
            |_item: &u32| {},
            |_item: &u32, _kind| {},
            move || {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            },
            || false,
            cancel,
        )
        .await;

        // Two items, two passes (neither recovers) = 4 settles.
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_input_runs_no_passes() {
        let cancel = CancellationToken::new();
        let remaining = run_retry_passes::<u32, u32, _, _, _, _, _, _>(
            vec![],
            8,
            |item, _idx, _cancel| async move { Ok(item) },
            |_item: &u32| {},
            |_item: &u32, _kind| {},
            || {},
            || false,
            cancel,
        )
        .await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn should_stop_aborts_the_pass_sequence() {
        let cancel = CancellationToken::new();
        let remaining = run_retry_passes::<u32, u32, _, _, _, _, _, _>(
            vec![1, 2, 3],
            8,
            |item, _idx, _cancel| async move { Ok(item) },
            |_item: &u32| {},
            |_item: &u32, _kind| {},
            || {},
            || true,
            cancel,
        )
        .await;
        // should_stop is true from the start, so the pass sequence never runs
        // and the original failures are returned unchanged.
        assert_eq!(remaining, vec![1, 2, 3]);
    }
}
