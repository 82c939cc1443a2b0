use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::postgres::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::programs::compute_common;
use crate::types::{Bar, RawBars, SourceInterval, TickerOutcome, Timeframe};

/// Per-ticker work shared by the `accumulation-scan` and `detector-scan`
/// programs: one-day bars, a 1d signal cadence, MA positions computed
/// inline (neither program runs the separate MA-enrichment fan-out —
/// `ScanProgram::runs_ma_enrichment` is false for both).
pub fn compute_ticker(ticker: &str, bars: &RawBars) -> TickerOutcome {
    compute_common(ticker, bars, SourceInterval::OneDay, Timeframe::OneDay, false, true)
}

/// Re-derive summary rows for every active ticker from the persisted
/// daily-bar history as of `as_of`, rather than from the bars fetched during
/// this run. This lets the summary
/// table reflect the full historical window even for tickers this run did
/// not re-fetch.
pub async fn rebuild_summaries_for_trade_date(pool: &PgPool, as_of: NaiveDate, scan_job_id: Uuid) -> Result<usize> {
    let tickers: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT ticker FROM daily_bars WHERE source_interval = $1 AND trade_date <= $2",
    )
    .bind(SourceInterval::OneDay.to_string())
    .bind(as_of)
    .fetch_all(pool)
    .await
    .context("failed to list tickers for summary rebuild")?;

    let mut rebuilt = 0usize;
    for (ticker,) in tickers {
        let rows: Vec<(NaiveDate, f64, f64, f64)> = sqlx::query_as(
            r#"
            SELECT trade_date, close, prev_close, volume_delta FROM daily_bars
            WHERE ticker = $1 AND source_interval = $2 AND trade_date <= $3
            ORDER BY trade_date ASC
            "#,
        )
        .bind(&ticker)
        .bind(SourceInterval::OneDay.to_string())
        .bind(as_of)
        .fetch_all(pool)
        .await
        .context("failed to load bar history for summary rebuild")?;

        if rows.is_empty() {
            continue;
        }

        let bars: Vec<Bar> = rows
            .iter()
            .map(|(trade_date, close, _prev_close, volume_delta)| Bar {
                timestamp: trade_date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp_millis(),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: *volume_delta,
            })
            .collect();

        let states = crate::programs::classify_all_windows(&bars);

        sqlx::query(
            r#"
            UPDATE summaries
            SET state_1d = $3, state_3d = $4, state_7d = $5, state_14d = $6, state_28d = $7,
                scan_job_id = $8, updated_at = now()
            WHERE ticker = $1 AND source_interval = $2
            "#,
        )
        .bind(&ticker)
        .bind(SourceInterval::OneDay.to_string())
        .bind(states.get(1).to_string())
        .bind(states.get(3).to_string())
        .bind(states.get(7).to_string())
        .bind(states.get(14).to_string())
        .bind(states.get(28).to_string())
        .bind(scan_job_id)
        .execute(pool)
        .await
        .context("failed to write rebuilt summary row")?;

        rebuilt += 1;
    }

    info!(rebuilt, as_of = %as_of, "rebuilt summaries from persisted daily bars");
    Ok(rebuilt)
}
