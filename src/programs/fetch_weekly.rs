use crate::programs::compute_common;
use crate::types::{RawBars, SourceInterval, TickerOutcome, Timeframe};

/// Per-ticker work for the `fetch-weekly` program: one-week bars, a 1w signal
/// cadence. No history backfill — weekly bars are not used for charting
/// backfill the way daily bars are.
pub fn compute_ticker(ticker: &str, bars: &RawBars) -> TickerOutcome {
    compute_common(ticker, bars, SourceInterval::OneWeek, Timeframe::OneWeek, false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;

    #[test]
    fn weekly_program_does_not_backfill_history() {
        let bars = vec![
            Bar { timestamp: 0, open: 10.0, high: 11.0, low: 9.0, close: 10.5, volume: 1_000.0 },
            Bar { timestamp: 604_800_000, open: 10.5, high: 11.5, low: 10.0, close: 11.0, volume: 1_200.0 },
        ];
        let outcome = compute_ticker("AAPL", &bars);
        match outcome {
            crate::types::TickerOutcome::Success(success) => assert!(success.history.is_empty()),
            _ => panic!("expected success"),
        }
    }
}
