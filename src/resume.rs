// =============================================================================
// Resume Codec — normalise, persist, and reload a scan's resume snapshot
// =============================================================================
//
// Persisted as JSON into `scan_jobs.notes`. `normalise` is a pure
// function: unknown keys are dropped silently by serde's default field
// handling (forward compatibility,).
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ScanProgram;

/// Sufficient state to restart a scan exactly where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub program: ScanProgram,
    pub source_interval: String,
    pub as_of_trade_date: Option<chrono::NaiveDate>,
    pub tickers: Vec<String>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub next_index: usize,
    #[serde(default)]
    pub processed: usize,
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub extra_per_program: BTreeMap<String, String>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub last_published_trade_date: Option<chrono::NaiveDate>,
}

impl ResumeSnapshot {
    /// Required extras per program: fetch programs need
    /// `as_of_trade_date`; the weekly program additionally needs a
    /// `weekly_trade_date` extra field.
    fn has_required_fields(&self) -> bool {
        if self.as_of_trade_date.is_none() {
            return false;
        }
        if self.program.requires_weekly_trade_date()
            && !self.extra_per_program.contains_key("weekly_trade_date")
        {
            return false;
        }
        true
    }
}

/// Normalise a raw snapshot: clamp indices into `[0, total]`, coerce counters
/// to non-negative, and reject the snapshot (returning `None`) if it fails
/// the "no-resume" checks of.
pub fn normalise(mut snapshot: ResumeSnapshot) -> Option<ResumeSnapshot> {
    if snapshot.total == 0 {
        return None;
    }

    snapshot.next_index = snapshot.next_index.min(snapshot.total);
    snapshot.processed = snapshot.processed.min(snapshot.total);
    snapshot.errors = snapshot.errors.min(snapshot.total);

    if snapshot.next_index >= snapshot.total {
        return None;
    }

    if !snapshot.has_required_fields() {
        return None;
    }

    Some(snapshot)
}

/// Apply the rewind invariant used when persisting a snapshot mid-stop
///: `next_index = max(0, processed - concurrency)`, then
/// `processed` is set equal to `next_index` so the two stay consistent.
pub fn rewind_for_stop(mut snapshot: ResumeSnapshot, concurrency: usize) -> ResumeSnapshot {
    let rewound = snapshot.processed.saturating_sub(concurrency);
    snapshot.next_index = rewound;
    snapshot.processed = rewound;
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> ResumeSnapshot {
        ResumeSnapshot {
            program: ScanProgram::FetchDaily,
            source_interval: "1day".to_string(),
            as_of_trade_date: Some(chrono::NaiveDate::from_ymd_opt(2026, 7, 20).unwrap()),
            tickers: vec!["AAPL".to_string(), "MSFT".to_string()],
            total: 10,
            next_index: 4,
            processed: 4,
            errors: 0,
            extra_per_program: BTreeMap::new(),
            lookback_days: Some(30),
            last_published_trade_date: None,
        }
    }

    #[test]
    fn normalise_clamps_next_index_into_range() {
        let mut s = base_snapshot();
        s.next_index = 9999;
        assert!(normalise(s).is_none(), "clamped next_index equals total, which is rejected");
    }

    #[test]
    fn normalise_accepts_a_valid_in_progress_snapshot() {
        let s = base_snapshot();
        let normalised = normalise(s.clone()).expect("should be resumable");
        assert_eq!(normalised.next_index, 4);
    }

    #[test]
    fn normalise_rejects_zero_total() {
        let mut s = base_snapshot();
        s.total = 0;
        assert!(normalise(s).is_none());
    }

    #[test]
    fn normalise_rejects_completed_snapshot() {
        let mut s = base_snapshot();
        s.next_index = 10;
        assert!(normalise(s).is_none());
    }

    #[test]
    fn normalise_rejects_missing_as_of_trade_date_for_fetch_program() {
        let mut s = base_snapshot();
        s.as_of_trade_date = None;
        assert!(normalise(s).is_none());
    }

    #[test]
    fn normalise_requires_weekly_trade_date_extra_for_weekly_program() {
        let mut s = base_snapshot();
        s.program = ScanProgram::FetchWeekly;
        assert!(normalise(s.clone()).is_none());

        s.extra_per_program.insert("weekly_trade_date".to_string(), "2026-07-17".to_string());
        assert!(normalise(s).is_some());
    }

    #[test]
    fn rewind_for_stop_sets_next_index_equal_to_processed() {
        let mut s = base_snapshot();
        s.processed = 20;
        let rewound = rewind_for_stop(s, 6);
        assert_eq!(rewound.next_index, 14);
        assert_eq!(rewound.processed, 14);
        assert_eq!(rewound.next_index, rewound.processed);
    }

    #[test]
    fn rewind_for_stop_never_goes_negative() {
        let mut s = base_snapshot();
        s.processed = 2;
        let rewound = rewind_for_stop(s, 10);
        assert_eq!(rewound.next_index, 0);
        assert_eq!(rewound.processed, 0);
    }
}
