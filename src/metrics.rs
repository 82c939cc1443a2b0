// =============================================================================
// Run Metrics Tracker — per-run accumulator
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::postgres::PgPool;

/// Counters for outbound API call outcomes, broken out by how the call
/// settled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiCallCounters {
    pub ok: u64,
    pub rate_limited: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub subscription_restricted: u64,
    pub latency_ms_histogram: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushRecord {
    pub duration_ms: u64,
    pub row_counts: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub duration_ms: u64,
}

/// A fully-assembled metrics snapshot, suitable for persistence as a
/// `run_metrics_history` row and for `get_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetricsSnapshot {
    pub run_id: String,
    pub final_status: String,
    pub phase_timings: Vec<PhaseTiming>,
    pub api_calls: ApiCallCounters,
    pub failed_tickers: Vec<String>,
    pub recovered_tickers: Vec<String>,
    pub db_flushes: Vec<FlushRecord>,
    pub stall_retries: u32,
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Inner {
    phase_start: Option<Instant>,
    current_phase: Option<String>,
    phase_timings: Vec<PhaseTiming>,
    api_calls: ApiCallCounters,
    failed_tickers: Vec<String>,
    recovered_tickers: Vec<String>,
    db_flushes: Vec<FlushRecord>,
    stall_retries: u32,
    total: usize,
    processed: usize,
    errors: usize,
    started_at: DateTime<Utc>,
}

impl Inner {
    fn new() -> Self {
        Self {
            phase_start: None,
            current_phase: None,
            phase_timings: Vec::new(),
            api_calls: ApiCallCounters::default(),
            failed_tickers: Vec::new(),
            recovered_tickers: Vec::new(),
            db_flushes: Vec::new(),
            stall_retries: 0,
            total: 0,
            processed: 0,
            errors: 0,
            started_at: Utc::now(),
        }
    }
}

/// Builder accumulating metrics over the life of one orchestrator run.
pub struct RunMetrics {
    run_id: String,
    inner: RwLock<Inner>,
}

impl RunMetrics {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            inner: RwLock::new(Inner::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Close out the previous phase's timing (if any) and start a new one.
    pub fn set_phase(&self, phase: &str) {
        let mut inner = self.inner.write();
        if let (Some(start), Some(name)) = (inner.phase_start.take(), inner.current_phase.take()) {
            inner.phase_timings.push(PhaseTiming {
                phase: name,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
        inner.current_phase = Some(phase.to_string());
        inner.phase_start = Some(Instant::now());
    }

    pub fn set_totals(&self, total: usize) {
        self.inner.write().total = total;
    }

    pub fn set_progress(&self, processed: usize, errors: usize) {
        let mut inner = self.inner.write();
        inner.processed = processed;
        inner.errors = errors;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_api_call(
        &self,
        latency_ms: u64,
        ok: bool,
        rate_limited: bool,
        aborted: bool,
        timed_out: bool,
        subscription_restricted: bool,
    ) {
        let mut inner = self.inner.write();
        inner.api_calls.latency_ms_histogram.push(latency_ms);
        if ok {
            inner.api_calls.ok += 1;
        }
        if rate_limited {
            inner.api_calls.rate_limited += 1;
        }
        if aborted {
            inner.api_calls.aborted += 1;
        }
        if timed_out {
            inner.api_calls.timed_out += 1;
        }
        if subscription_restricted {
            inner.api_calls.subscription_restricted += 1;
        }
    }

    pub fn record_failed_ticker(&self, ticker: &str) {
        self.inner.write().failed_tickers.push(ticker.to_string());
    }

    pub fn record_retry_recovered(&self, ticker: &str) {
        self.inner.write().recovered_tickers.push(ticker.to_string());
    }

    pub fn record_db_flush(&self, duration_ms: u64, row_counts: HashMap<String, usize>) {
        self.inner.write().db_flushes.push(FlushRecord { duration_ms, row_counts });
    }

    pub fn record_stall_retry(&self) {
        self.inner.write().stall_retries += 1;
    }

    /// Finalise the accumulator into an immutable snapshot for persistence.
    pub fn finish(&self, final_status: &str) -> RunMetricsSnapshot {
        self.set_phase("finished");
        let inner = self.inner.read();
        RunMetricsSnapshot {
            run_id: self.run_id.clone(),
            final_status: final_status.to_string(),
            phase_timings: inner.phase_timings.clone(),
            api_calls: inner.api_calls.clone(),
            failed_tickers: inner.failed_tickers.clone(),
            recovered_tickers: inner.recovered_tickers.clone(),
            db_flushes: inner.db_flushes.clone(),
            stall_retries: inner.stall_retries,
            total: inner.total,
            processed: inner.processed,
            errors: inner.errors,
            started_at: inner.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Append `snapshot` as a row in `run_metrics_history`. Best-effort from the
/// caller's perspective — a failure here should be logged, not allowed to
/// mask the run's actual outcome.
pub async fn persist_run_metrics(
    pool: &PgPool,
    run_type: &str,
    snapshot: &RunMetricsSnapshot,
) -> Result<(), sqlx::Error> {
    let snapshot_json = serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null);
    sqlx::query(
        r#"
        INSERT INTO run_metrics_history (run_id, run_type, status, snapshot, started_at, finished_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (run_id) DO UPDATE SET
            status = EXCLUDED.status, snapshot = EXCLUDED.snapshot, finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(&snapshot.run_id)
    .bind(run_type)
    .bind(&snapshot.final_status)
    .bind(snapshot_json)
    .bind(snapshot.started_at)
    .bind(snapshot.finished_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_phase_records_the_prior_phases_duration() {
        let metrics = RunMetrics::new("run-1".to_string());
        metrics.set_phase("core");
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.set_phase("retry");

        let snapshot = metrics.finish("completed");
        assert_eq!(snapshot.phase_timings[0].phase, "core");
        assert_eq!(snapshot.phase_timings[1].phase, "retry");
    }

    #[test]
    fn record_api_call_accumulates_each_counter_independently() {
        let metrics = RunMetrics::new("run-1".to_string());
        metrics.record_api_call(100, true, false, false, false, false);
        metrics.record_api_call(50, false, true, false, false, false);
        metrics.record_api_call(30, false, false, true, false, false);

        let snapshot = metrics.finish("completed");
        assert_eq!(snapshot.api_calls.ok, 1);
        assert_eq!(snapshot.api_calls.rate_limited, 1);
        assert_eq!(snapshot.api_calls.aborted, 1);
        assert_eq!(snapshot.api_calls.latency_ms_histogram.len(), 3);
    }

    #[test]
    fn failed_and_recovered_tickers_are_tracked_separately() {
        let metrics = RunMetrics::new("run-1".to_string());
        metrics.record_failed_ticker("AAPL");
        metrics.record_retry_recovered("AAPL");
        metrics.record_failed_ticker("MSFT");

        let snapshot = metrics.finish("completed-with-errors");
        assert_eq!(snapshot.failed_tickers, vec!["AAPL", "MSFT"]);
        assert_eq!(snapshot.recovered_tickers, vec!["AAPL"]);
    }
}
