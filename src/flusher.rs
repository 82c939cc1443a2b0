// =============================================================================
// Batched Flusher — serialised, size-triggered write pipeline
// =============================================================================
//
// Workers append rows into `OutcomeBuffers` behind a mutex. A single
// consumer task owns the database handle and processes `FlushCommand`s from
// an mpsc channel one at a time, which is what gives the flush chain its
// total order: flush N's effects are committed before flush N+1 is even
// dequeued. Each flush detaches the current buffers (swap-with-empty) before
// writing, so a flush in flight never races a worker's append.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::types::{HistoryRow, LatestBarRow, NeutralMarker, SignalRow, SummaryRow};

#[derive(Default)]
pub struct OutcomeBuffers {
    pub bars: Vec<LatestBarRow>,
    pub summaries: Vec<SummaryRow>,
    pub ma_summaries: Vec<SummaryRow>,
    pub signals: Vec<SignalRow>,
    pub neutral_markers: Vec<NeutralMarker>,
    pub history: Vec<HistoryRow>,
}

impl OutcomeBuffers {
    fn len(&self) -> usize {
        self.bars.len()
            + self.summaries.len()
            + self.ma_summaries.len()
            + self.signals.len()
            + self.neutral_markers.len()
            + self.history.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FlushCommand {
    buffers: OutcomeBuffers,
    scan_job_id: Uuid,
    reply: oneshot::Sender<HashMap<String, usize>>,
}

pub struct BatchedFlusher {
    buffers: Mutex<OutcomeBuffers>,
    tx: mpsc::Sender<FlushCommand>,
    scan_job_id: Uuid,
    fetch_run_summary_flush_size: usize,
    summary_upsert_batch_size: usize,
}

impl BatchedFlusher {
    pub fn new(
        pool: PgPool,
        scan_job_id: Uuid,
        fetch_run_summary_flush_size: usize,
        summary_upsert_batch_size: usize,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<FlushCommand>(32);

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let row_counts = write_buffers(&pool, &cmd.buffers, cmd.scan_job_id).await;
                let _ = cmd.reply.send(row_counts);
            }
        });

        Arc::new(Self {
            buffers: Mutex::new(OutcomeBuffers::default()),
            tx,
            scan_job_id,
            fetch_run_summary_flush_size,
            summary_upsert_batch_size,
        })
    }

    pub fn push_bar(&self, row: LatestBarRow) {
        let mut buffers = self.buffers.lock();
        buffers.bars.push(row);
        self.maybe_trigger(buffers);
    }

    pub fn push_history(&self, rows: Vec<HistoryRow>) {
        let mut buffers = self.buffers.lock();
        buffers.history.extend(rows);
        self.maybe_trigger(buffers);
    }

    pub fn push_summary(&self, row: SummaryRow) {
        let mut buffers = self.buffers.lock();
        buffers.summaries.push(row);
        self.maybe_trigger(buffers);
    }

    pub fn push_ma_summary(&self, row: SummaryRow) {
        let mut buffers = self.buffers.lock();
        buffers.ma_summaries.push(row);
        self.maybe_trigger(buffers);
    }

    pub fn push_signal(&self, row: SignalRow) {
        let mut buffers = self.buffers.lock();
        buffers.signals.push(row);
        self.maybe_trigger(buffers);
    }

    pub fn push_neutral_marker(&self, row: NeutralMarker) {
        let mut buffers = self.buffers.lock();
        buffers.neutral_markers.push(row);
        self.maybe_trigger(buffers);
    }

    /// Size-triggered flush check; fire-and-forget — a background flush's
    /// row counts are only consumed by metrics, not awaited on the hot path.
    fn maybe_trigger(&self, mut buffers: parking_lot::MutexGuard<'_, OutcomeBuffers>) {
        let summary_like = buffers.summaries.len() + buffers.ma_summaries.len();
        let should_flush = buffers.bars.len() + buffers.history.len() >= self.fetch_run_summary_flush_size
            || summary_like >= self.summary_upsert_batch_size;
        if !should_flush {
            return;
        }

        let detached = std::mem::take(&mut *buffers);

        let (reply_tx, _reply_rx) = oneshot::channel();
        let cmd = FlushCommand { buffers: detached, scan_job_id: self.scan_job_id, reply: reply_tx };
        if let Err(mpsc::error::TrySendError::Full(cmd) | mpsc::error::TrySendError::Closed(cmd)) = self.tx.try_send(cmd) {
            warn!("flush queue full or consumer gone — re-merging rows for the next trigger");
            merge_back(&mut buffers, cmd.buffers);
        }
    }

    /// Explicit drain: detaches whatever remains and blocks until that
    /// specific flush completes, returning its per-kind row counts for
    /// metrics. Used between orchestrator phases and at termination.
    pub async fn drain(&self) -> HashMap<String, usize> {
        let detached = std::mem::take(&mut *self.buffers.lock());
        if detached.is_empty() {
            return HashMap::new();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = FlushCommand { buffers: detached, scan_job_id: self.scan_job_id, reply: reply_tx };

        if self.tx.send(cmd).await.is_err() {
            warn!("flush consumer task is gone — drain could not be delivered");
            return HashMap::new();
        }

        reply_rx.await.unwrap_or_default()
    }
}

/// Splice a detached buffer's rows back in front of whatever has accumulated
/// in `live` since it was detached, preserving arrival order.
fn merge_back(live: &mut OutcomeBuffers, detached: OutcomeBuffers) {
    prepend(&mut live.bars, detached.bars);
    prepend(&mut live.summaries, detached.summaries);
    prepend(&mut live.ma_summaries, detached.ma_summaries);
    prepend(&mut live.signals, detached.signals);
    prepend(&mut live.neutral_markers, detached.neutral_markers);
    prepend(&mut live.history, detached.history);
}

fn prepend<T>(live: &mut Vec<T>, mut detached: Vec<T>) {
    detached.append(live);
    *live = detached;
}

async fn write_buffers(pool: &PgPool, buffers: &OutcomeBuffers, scan_job_id: Uuid) -> HashMap<String, usize> {
    let mut counts = HashMap::new();

    if let Err(e) = upsert_bars(pool, &buffers.bars, scan_job_id).await {
        error!(error = %e, "failed to upsert daily bars — flush failure is non-fatal to the run");
    } else if !buffers.bars.is_empty() {
        counts.insert("bars".to_string(), buffers.bars.len());
    }

    if let Err(e) = upsert_history(pool, &buffers.history, scan_job_id).await {
        error!(error = %e, "failed to upsert history rows");
    } else if !buffers.history.is_empty() {
        counts.insert("history".to_string(), buffers.history.len());
    }

    if let Err(e) = upsert_summaries(pool, &buffers.summaries, scan_job_id, false).await {
        error!(error = %e, "failed to upsert summaries");
    } else if !buffers.summaries.is_empty() {
        counts.insert("summaries".to_string(), buffers.summaries.len());
    }

    if let Err(e) = upsert_summaries(pool, &buffers.ma_summaries, scan_job_id, true).await {
        error!(error = %e, "failed to upsert MA-enrichment summaries");
    } else if !buffers.ma_summaries.is_empty() {
        counts.insert("ma_summaries".to_string(), buffers.ma_summaries.len());
    }

    if let Err(e) = upsert_signals(pool, &buffers.signals, scan_job_id).await {
        error!(error = %e, "failed to upsert signals");
    } else if !buffers.signals.is_empty() {
        counts.insert("signals".to_string(), buffers.signals.len());
    }

    if let Err(e) = delete_neutral_signals(pool, &buffers.neutral_markers).await {
        error!(error = %e, "failed to delete neutral-marker signals");
    } else if !buffers.neutral_markers.is_empty() {
        counts.insert("neutral_deletes".to_string(), buffers.neutral_markers.len());
    }

    info!(?counts, "flush completed");
    counts
}

async fn upsert_bars(pool: &PgPool, rows: &[LatestBarRow], scan_job_id: Uuid) -> Result<(), sqlx::Error> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO daily_bars (ticker, trade_date, source_interval, close, prev_close, volume_delta, scan_job_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (ticker, trade_date, source_interval)
            DO UPDATE SET close = EXCLUDED.close, prev_close = EXCLUDED.prev_close,
                          volume_delta = EXCLUDED.volume_delta, scan_job_id = EXCLUDED.scan_job_id,
                          updated_at = now()
            "#,
        )
        .bind(&row.ticker)
        .bind(row.trade_date)
        .bind(row.source_interval.to_string())
        .bind(row.close)
        .bind(row.prev_close)
        .bind(row.volume_delta)
        .bind(scan_job_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn upsert_history(pool: &PgPool, rows: &[HistoryRow], scan_job_id: Uuid) -> Result<(), sqlx::Error> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO daily_bars (ticker, trade_date, source_interval, close, prev_close, volume_delta, scan_job_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (ticker, trade_date, source_interval)
            DO UPDATE SET close = EXCLUDED.close, prev_close = EXCLUDED.prev_close,
                          volume_delta = EXCLUDED.volume_delta, updated_at = now()
            "#,
        )
        .bind(&row.ticker)
        .bind(row.trade_date)
        .bind(row.source_interval.to_string())
        .bind(row.close)
        .bind(row.prev_close)
        .bind(row.volume_delta)
        .bind(scan_job_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// `ma_only` selects the MA-enrichment upsert path, where the MA columns
/// overwrite-if-non-null and the divergence state columns are left alone
///.
async fn upsert_summaries(
    pool: &PgPool,
    rows: &[SummaryRow],
    scan_job_id: Uuid,
    ma_only: bool,
) -> Result<(), sqlx::Error> {
    for row in rows {
        if ma_only {
            sqlx::query(
                r#"
                UPDATE summaries
                SET ma8_above = COALESCE($3, ma8_above),
                    ma21_above = COALESCE($4, ma21_above),
                    ma50_above = COALESCE($5, ma50_above),
                    ma200_above = COALESCE($6, ma200_above),
                    scan_job_id = $7, updated_at = now()
                WHERE ticker = $1 AND source_interval = $2
                "#,
            )
            .bind(&row.ticker)
            .bind(row.source_interval.to_string())
            .bind(row.ma.ma8_above)
            .bind(row.ma.ma21_above)
            .bind(row.ma.ma50_above)
            .bind(row.ma.ma200_above)
            .bind(scan_job_id)
            .execute(pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO summaries
                    (ticker, source_interval, trade_date, state_1d, state_3d, state_7d, state_14d, state_28d,
                     ma8_above, ma21_above, ma50_above, ma200_above, scan_job_id, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
                ON CONFLICT (ticker, source_interval)
                DO UPDATE SET trade_date = EXCLUDED.trade_date,
                              state_1d = EXCLUDED.state_1d, state_3d = EXCLUDED.state_3d,
                              state_7d = EXCLUDED.state_7d, state_14d = EXCLUDED.state_14d,
                              state_28d = EXCLUDED.state_28d,
                              ma8_above = COALESCE(EXCLUDED.ma8_above, summaries.ma8_above),
                              ma21_above = COALESCE(EXCLUDED.ma21_above, summaries.ma21_above),
                              ma50_above = COALESCE(EXCLUDED.ma50_above, summaries.ma50_above),
                              ma200_above = COALESCE(EXCLUDED.ma200_above, summaries.ma200_above),
                              scan_job_id = EXCLUDED.scan_job_id, updated_at = now()
                "#,
            )
            .bind(&row.ticker)
            .bind(row.source_interval.to_string())
            .bind(row.trade_date)
            .bind(row.states.get(1).to_string())
            .bind(row.states.get(3).to_string())
            .bind(row.states.get(7).to_string())
            .bind(row.states.get(14).to_string())
            .bind(row.states.get(28).to_string())
            .bind(row.ma.ma8_above)
            .bind(row.ma.ma21_above)
            .bind(row.ma.ma50_above)
            .bind(row.ma.ma200_above)
            .bind(scan_job_id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

async fn upsert_signals(pool: &PgPool, rows: &[SignalRow], scan_job_id: Uuid) -> Result<(), sqlx::Error> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO signals
                (ticker, signal_type, trade_date, price, prev_close, volume_delta, timeframe, source_interval, timestamp, scan_job_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), $9)
            ON CONFLICT (trade_date, ticker, timeframe, source_interval)
            DO UPDATE SET signal_type = EXCLUDED.signal_type, price = EXCLUDED.price,
                          prev_close = EXCLUDED.prev_close, volume_delta = EXCLUDED.volume_delta,
                          timestamp = now(), scan_job_id = EXCLUDED.scan_job_id
            "#,
        )
        .bind(&row.ticker)
        .bind(row.signal_type.to_string())
        .bind(row.trade_date)
        .bind(row.price)
        .bind(row.prev_close)
        .bind(row.volume_delta)
        .bind(row.timeframe.to_string())
        .bind(row.source_interval.to_string())
        .bind(scan_job_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Delete any prior signal for `(ticker, trade_date, timeframe, source_interval)`
/// tagged by a neutral marker — a neutral result means "no signal",
/// not "a neutral-typed signal".
async fn delete_neutral_signals(pool: &PgPool, markers: &[NeutralMarker]) -> Result<(), sqlx::Error> {
    for marker in markers {
        sqlx::query(
            r#"
            DELETE FROM signals
            WHERE ticker = $1 AND trade_date = $2 AND timeframe = $3 AND source_interval = $4
            "#,
        )
        .bind(&marker.ticker)
        .bind(marker.trade_date)
        .bind(marker.timeframe.to_string())
        .bind(marker.source_interval.to_string())
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MaPositions, SourceInterval, SummaryStates};

    fn sample_summary() -> SummaryRow {
        SummaryRow {
            ticker: "AAPL".to_string(),
            source_interval: SourceInterval::OneDay,
            trade_date: NaiveDate::from_ymd_opt(2026, 7, 20).unwrap(),
            states: SummaryStates::all_neutral(),
            ma: MaPositions::default(),
        }
    }

    #[test]
    fn outcome_buffers_len_counts_every_kind() {
        let mut buffers = OutcomeBuffers::default();
        assert!(buffers.is_empty());
        buffers.summaries.push(sample_summary());
        assert_eq!(buffers.len(), 1);
        assert!(!buffers.is_empty());
    }

    #[test]
    fn outcome_buffers_default_is_empty() {
        assert!(OutcomeBuffers::default().is_empty());
    }

    #[test]
    fn merge_back_prepends_detached_rows_ahead_of_whatever_arrived_since() {
        let mut live = OutcomeBuffers::default();
        live.summaries.push(sample_summary());

        let mut detached = OutcomeBuffers::default();
        let mut older = sample_summary();
        older.ticker = "MSFT".to_string();
        detached.summaries.push(older);

        merge_back(&mut live, detached);
        assert_eq!(live.summaries.len(), 2);
        assert_eq!(live.summaries[0].ticker, "MSFT");
        assert_eq!(live.summaries[1].ticker, "AAPL");
    }
}
