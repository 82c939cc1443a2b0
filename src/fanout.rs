// =============================================================================
// Bounded Fan-out — fixed worker pool over an ordered item list
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::FetchErrorKind;

/// The outcome of one item's work, captured without propagating a panic or
/// error out of the fan-out call itself.
#[derive(Debug, Clone)]
pub enum Settled<T> {
    Ok(T),
    Err(FetchErrorKind),
}

impl<T> Settled<T> {
    pub fn is_err(&self) -> bool {
        matches!(self, Settled::Err(_))
    }

    pub fn as_err(&self) -> Option<&FetchErrorKind> {
        match self {
            Settled::Err(e) => Some(e),
            _ => None,
        }
    }
}

/// Drive `worker` over `items` with at most `concurrency` tasks in flight.
///
/// Workers pull the next index from a shared atomic cursor. Before pulling,
/// each worker checks `should_stop()`; if true, it advances the cursor to
/// the end (so siblings find no more work) and fires `cancel` so in-flight
/// suspension points observe it promptly. `on_settled` runs synchronously
/// between an item's completion and the next pull — it is the caller's
/// progress hook and its own errors/panics never abort the fan-out.
///
/// After cancellation, the call still awaits every spawned worker to finish
/// its current item before returning, so `items`/shared buffers are never
/// mutated after this function returns.
pub async fn map_with_concurrency<T, I, W, Fut, S, OnSettled>(
    items: Vec<I>,
    concurrency: usize,
    worker: W,
    on_settled: OnSettled,
    should_stop: S,
    cancel: CancellationToken,
) -> Vec<Settled<T>>
where
    I: Clone + Send + Sync + 'static,
    T: Send + 'static,
    W: Fn(I, usize, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchErrorKind>> + Send,
    S: Fn() -> bool + Send + Sync + 'static,
    OnSettled: Fn(&Settled<T>, usize, &I) + Send + Sync + 'static,
{
    let len = items.len();
    let items = Arc::new(items);
    let worker = Arc::new(worker);
    let on_settled = Arc::new(on_settled);
    let should_stop = Arc::new(should_stop);
    let cursor = Arc::new(AtomicUsize::new(0));

    // Preallocate slots so out-of-order completion still lands at the
    // original index.
    let results: Arc<std::sync::Mutex<Vec<Option<Settled<T>>>>> =
        Arc::new(std::sync::Mutex::new((0..len).map(|_| None).collect()));

    let worker_count = concurrency.min(len).max(if len == 0 { 0 } else { 1 });
    let mut handles = Vec::with_capacity(worker_count);

    for _ in 0..worker_count {
        let items = items.clone();
        let worker = worker.clone();
        let on_settled = on_settled.clone();
        let should_stop = should_stop.clone();
        let cursor = cursor.clone();
        let results = results.clone();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            loop {
                if should_stop() {
                    // Drain the cursor so siblings also observe "no more work"
                    // and propagate cancellation for anything mid-flight.
                    cursor.store(len, Ordering::SeqCst);
                    cancel.cancel();
                    break;
                }

                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                if idx >= len {
                    break;
                }

                let item = items[idx].clone();
                let outcome = worker(item.clone(), idx, cancel.clone()).await;
                let settled = match outcome {
                    Ok(value) => Settled::Ok(value),
                    Err(kind) => Settled::Err(kind),
                };

                on_settled(&settled, idx, &item);

                if let Ok(mut guard) = results.lock() {
                    guard[idx] = Some(settled);
                }
            }
        }));
    }

    for handle in handles {
        // A panicking worker is itself a defect, but we must not let it
        // propagate and strand siblings awaiting `results`; surface nothing
        // for its slot rather than poisoning the whole fan-out.
        let _ = handle.await;
    }

    let mut guard = results.lock().expect("fan-out results mutex poisoned");
    std::mem::take(&mut *guard)
        .into_iter()
        .map(|slot| slot.unwrap_or(Settled::Err(FetchErrorKind::Aborted)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn processes_every_item_and_preserves_index_alignment() {
        let items: Vec<u32> = (0..10).collect();
        let cancel = CancellationToken::new();

        let results = map_with_concurrency(
            items,
            3,
            |item: u32, _idx, _cancel| async move { Ok::<u32, FetchErrorKind>(item * 2) },
            |_settled: &Settled<u32>, _idx, _item: &u32| {},
            || false,
            cancel,
        )
        .await;

        assert_eq!(results.len(), 10);
        for (i, r) in results.iter().enumerate() {
            match r {
                Settled::Ok(v) => assert_eq!(*v, i as u32 * 2),
                Settled::Err(_) => panic!("unexpected error at {i}"),
            }
        }
    }

    #[tokio::test]
    async fn captures_errors_without_propagating() {
        let items = vec![1u32, 2, 3, 4];
        let cancel = CancellationToken::new();

        let results = map_with_concurrency(
            items,
            2,
            |item: u32, _idx, _cancel| async move {
                if item % 2 == 0 {
                    Err(FetchErrorKind::BadStatus(500))
                } else {
                    Ok(item)
                }
            },
            |_s: &Settled<u32>, _i, _item: &u32| {},
            || false,
            cancel,
        )
        .await;

        let errs = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(errs, 2);
    }

    #[tokio::test]
    async fn on_settled_is_invoked_exactly_once_per_item() {
        let items: Vec<u32> = (0..20).collect();
        let cancel = CancellationToken::new();
        let settled_count = Arc::new(AtomicU32::new(0));
        let counter = settled_count.clone();

        let _results = map_with_concurrency(
            items,
            5,
            |item: u32, _idx, _cancel| async move { Ok::<u32, FetchErrorKind>(item) },
            move |_s: &Settled<u32>, _i, _item: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || false,
            cancel,
        )
        .await;

        assert_eq!(settled_count.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn should_stop_halts_new_pulls_and_cancels_in_flight() {
        let items: Vec<u32> = (0..50).collect();
        let cancel = CancellationToken::new();
        let processed = Arc::new(AtomicU32::new(0));
        let stop_after = Arc::new(AtomicU32::new(5));

        let processed_for_worker = processed.clone();
        let processed_for_stop = processed.clone();

        let results = map_with_concurrency(
            items,
            4,
            move |_item: u32, _idx, _cancel| {
                let processed = processed_for_worker.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, FetchErrorKind>(0)
                }
            },
            |_s: &Settled<u32>, _i, _item: &u32| {},
            move || processed_for_stop.load(Ordering::SeqCst) >= stop_after.load(Ordering::SeqCst),
            cancel.clone(),
        )
        .await;

        // Not every item should have run; should_stop fired partway through.
        assert!(results.iter().filter(|r| matches!(r, Settled::Ok(_))).count() < 50);
    }
}
