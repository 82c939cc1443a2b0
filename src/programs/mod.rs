// =============================================================================
// Scan Programs — per-ticker pure computation
// =============================================================================
//
// These are minimal, honestly-labelled reference implementations of the
// domain math the orchestration contract treats as an external collaborator
//: a simple price/volume divergence classifier and moving-average
// position check, not a claim of trading-grade accuracy.
// =============================================================================

pub mod accumulation_scan;
pub mod fetch_daily;
pub mod fetch_weekly;

use chrono::NaiveDate;

use crate::types::{
    Bar, LatestBarRow, MaPositions, RawBars, ScanProgram, SignalRow, SkippedReason,
    SourceInterval, SummaryClass, SummaryRow, SummaryStates, Timeframe, TickerOutcome,
    TickerSuccess, LOOKBACK_WINDOWS,
};

/// Dispatch to the per-program ticker computation. `AccumulationScan` and
/// `DetectorScan` share one implementation (`accumulation_scan::compute_ticker`) —
/// they differ only in the concurrency the orchestrator runs them at.
pub fn compute_ticker(program: ScanProgram, ticker: &str, bars: &RawBars) -> TickerOutcome {
    match program {
        ScanProgram::FetchDaily => fetch_daily::compute_ticker(ticker, bars),
        ScanProgram::FetchWeekly => fetch_weekly::compute_ticker(ticker, bars),
        ScanProgram::AccumulationScan | ScanProgram::DetectorScan => {
            accumulation_scan::compute_ticker(ticker, bars)
        }
    }
}

/// Classify price/volume divergence over `window` trading days ending at the
/// last bar: price up + volume down is read as bearish (demand weakening
/// into the rally); price down + volume up as bullish (accumulation into
/// weakness); anything else is neutral.
pub fn classify_window(bars: &[Bar], window: u32) -> SummaryClass {
    let window = window as usize;
    if bars.len() <= window {
        return SummaryClass::Neutral;
    }

    let last = bars.len() - 1;
    let start = last - window;

    let price_change = bars[last].close - bars[start].close;
    let volume_change = bars[last].volume - bars[start].volume;

    if price_change > 0.0 && volume_change < 0.0 {
        SummaryClass::Bearish
    } else if price_change < 0.0 && volume_change > 0.0 {
        SummaryClass::Bullish
    } else {
        SummaryClass::Neutral
    }
}

/// Build the full `{1,3,7,14,28}` classification map.
pub fn classify_all_windows(bars: &[Bar]) -> SummaryStates {
    let classes = LOOKBACK_WINDOWS
        .iter()
        .map(|&w| (w, classify_window(bars, w)))
        .collect();
    SummaryStates::from_map(classes)
}

fn simple_moving_average(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period || period == 0 {
        return None;
    }
    let sum: f64 = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / period as f64)
}

/// Whether the latest close sits above each of the MA8/21/50/200 windows.
/// `None` for a window with insufficient history, which persists as
/// "overwrite-if-non-null" at the store layer.
pub fn ma_positions(bars: &[Bar]) -> MaPositions {
    let Some(latest) = bars.last() else {
        return MaPositions::default();
    };
    MaPositions {
        ma8_above: simple_moving_average(bars, 8).map(|ma| latest.close > ma),
        ma21_above: simple_moving_average(bars, 21).map(|ma| latest.close > ma),
        ma50_above: simple_moving_average(bars, 50).map(|ma| latest.close > ma),
        ma200_above: simple_moving_average(bars, 200).map(|ma| latest.close > ma),
    }
}

fn bar_trade_date(bar: &Bar) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(bar.timestamp)
        .map(|dt| dt.naive_utc().date())
        .unwrap_or_default()
}

/// Shared core: build a `TickerSuccess` from raw bars for a one-bar-per-day
/// source interval. `timeframe` selects the signal cadence (1d for daily,
/// 1w for weekly); `include_history` backfills one `HistoryRow` per bar.
pub fn compute_common(
    ticker: &str,
    bars: &RawBars,
    source_interval: SourceInterval,
    timeframe: Timeframe,
    include_history: bool,
    run_ma_enrichment: bool,
) -> TickerOutcome {
    if bars.is_empty() {
        return TickerOutcome::Skipped(SkippedReason(
            "provider returned no bars for this ticker".to_string(),
        ));
    }

    let latest = bars.last().expect("checked non-empty above");
    let prev_close = if bars.len() >= 2 { bars[bars.len() - 2].close } else { latest.close };
    let trade_date = bar_trade_date(latest);
    let volume_delta = if bars.len() >= 2 { latest.volume - bars[bars.len() - 2].volume } else { 0.0 };

    let states = classify_all_windows(bars);
    let ma = if run_ma_enrichment { ma_positions(bars) } else { MaPositions::default() };

    let one_day_class = states.get(1);
    let (signal, neutral_marker) = if one_day_class == SummaryClass::Neutral {
        (
            None,
            Some(crate::types::NeutralMarker {
                ticker: ticker.to_string(),
                trade_date,
                timeframe,
                source_interval,
            }),
        )
    } else {
        (
            Some(SignalRow {
                ticker: ticker.to_string(),
                signal_type: one_day_class,
                trade_date,
                price: latest.close,
                prev_close,
                volume_delta,
                timeframe,
                source_interval,
            }),
            None,
        )
    };

    let history = if include_history {
        bars.iter()
            .enumerate()
            .map(|(i, bar)| crate::types::HistoryRow {
                ticker: ticker.to_string(),
                source_interval,
                trade_date: bar_trade_date(bar),
                close: bar.close,
                prev_close: if i > 0 { bars[i - 1].close } else { bar.close },
                volume_delta: if i > 0 { bar.volume - bars[i - 1].volume } else { 0.0 },
            })
            .collect()
    } else {
        Vec::new()
    };

    TickerOutcome::Success(TickerSuccess {
        latest_bar: Some(LatestBarRow {
            ticker: ticker.to_string(),
            source_interval,
            trade_date,
            close: latest.close,
            prev_close,
            volume_delta,
        }),
        summary: Some(SummaryRow {
            ticker: ticker.to_string(),
            source_interval,
            trade_date,
            states,
            ma,
        }),
        signal,
        neutral_marker,
        history,
    })
}
