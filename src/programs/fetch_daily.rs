use crate::programs::compute_common;
use crate::types::{RawBars, SourceInterval, TickerOutcome, Timeframe};

/// Per-ticker work for the `fetch-daily` program: one-day bars, a 1d signal
/// cadence, full history backfill, MA enrichment deferred to the optional
/// enrichment pass.
pub fn compute_ticker(ticker: &str, bars: &RawBars) -> TickerOutcome {
    compute_common(ticker, bars, SourceInterval::OneDay, Timeframe::OneDay, true, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;

    #[test]
    fn skips_tickers_the_provider_has_no_history_for() {
        let outcome = compute_ticker("ZZZZ", &vec![]);
        assert!(matches!(outcome, TickerOutcome::Skipped(_)));
    }

    #[test]
    fn produces_a_latest_bar_row_for_a_normal_ticker() {
        let bars = vec![
            Bar { timestamp: 0, open: 10.0, high: 11.0, low: 9.0, close: 10.5, volume: 1_000.0 },
            Bar { timestamp: 86_400_000, open: 10.5, high: 11.5, low: 10.0, close: 11.0, volume: 1_200.0 },
        ];
        let outcome = compute_ticker("AAPL", &bars);
        match outcome {
            TickerOutcome::Success(success) => {
                assert_eq!(success.latest_bar.unwrap().close, 11.0);
                assert_eq!(success.history.len(), 2);
            }
            _ => panic!("expected success"),
        }
    }
}
