// =============================================================================
// Shared types — scan universe, bars, and per-ticker outcomes
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `^[A-Z][A-Z0-9.\-]{0,15}$` — uppercased, 1-16 chars, leading letter.
fn ticker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9.\-]{0,15}$").expect("valid regex"))
}

/// Validate and uppercase a raw symbol string.
///
/// Returns `None` if, after uppercasing, the symbol does not match the
/// ticker grammar. The core never owns a `Ticker` type at rest — callers
/// pass plain `String`s validated at the boundary.
pub fn validate_ticker(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    if ticker_pattern().is_match(&upper) {
        Some(upper)
    } else {
        None
    }
}

/// The concrete scan program being run. Programs differ in per-ticker work
/// and which output buffers they populate; orchestration is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanProgram {
    FetchDaily,
    FetchWeekly,
    AccumulationScan,
    DetectorScan,
}

impl ScanProgram {
    /// API calls spent per ticker, used by adaptive concurrency.
    pub fn api_calls_per_ticker(self) -> u32 {
        match self {
            ScanProgram::FetchDaily => 8,
            ScanProgram::FetchWeekly => 10,
            ScanProgram::AccumulationScan => 8,
            ScanProgram::DetectorScan => 8,
        }
    }

    /// Whether this program runs the optional MA-enrichment fan-out after the core + retry passes.
    pub fn runs_ma_enrichment(self) -> bool {
        matches!(self, ScanProgram::FetchDaily | ScanProgram::FetchWeekly)
    }

    /// Whether a resume snapshot targeting this program must carry a
    /// `weekly_trade_date` extra field to be considered valid.
    pub fn requires_weekly_trade_date(self) -> bool {
        matches!(self, ScanProgram::FetchWeekly)
    }

    /// Per-program memory class — the detector scan is memory-intensive per
    /// ticker and is hard-clamped to a low concurrency ceiling regardless of
    /// the configured/adaptive value.
    pub fn memory_class_ceiling(self) -> Option<usize> {
        match self {
            ScanProgram::DetectorScan => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for ScanProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanProgram::FetchDaily => "fetch-daily",
            ScanProgram::FetchWeekly => "fetch-weekly",
            ScanProgram::AccumulationScan => "accumulation-scan",
            ScanProgram::DetectorScan => "detector-scan",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScanProgram {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch-daily" => Ok(ScanProgram::FetchDaily),
            "fetch-weekly" => Ok(ScanProgram::FetchWeekly),
            "accumulation-scan" => Ok(ScanProgram::AccumulationScan),
            "detector-scan" => Ok(ScanProgram::DetectorScan),
            other => Err(format!("unknown scan program: {other}")),
        }
    }
}

/// The smallest bar size at which the provider is queried; tags every
/// computed row and drives the natural key of per-bar outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceInterval {
    OneMin,
    FiveMin,
    FifteenMin,
    ThirtyMin,
    OneHour,
    FourHour,
    OneDay,
    OneWeek,
}

impl fmt::Display for SourceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceInterval::OneMin => "1min",
            SourceInterval::FiveMin => "5min",
            SourceInterval::FifteenMin => "15min",
            SourceInterval::ThirtyMin => "30min",
            SourceInterval::OneHour => "1hour",
            SourceInterval::FourHour => "4hour",
            SourceInterval::OneDay => "1day",
            SourceInterval::OneWeek => "1week",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1min" => Ok(SourceInterval::OneMin),
            "5min" => Ok(SourceInterval::FiveMin),
            "15min" => Ok(SourceInterval::FifteenMin),
            "30min" => Ok(SourceInterval::ThirtyMin),
            "1hour" => Ok(SourceInterval::OneHour),
            "4hour" => Ok(SourceInterval::FourHour),
            "1day" => Ok(SourceInterval::OneDay),
            "1week" => Ok(SourceInterval::OneWeek),
            other => Err(format!("unknown source interval: {other}")),
        }
    }
}

/// A single OHLCV bar fetched from the provider. Scoped to one per-ticker
/// work unit; never persisted directly (summaries/signals derived from it
/// are what get written).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Unix millis.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Ordered sequence of bars for one ticker, oldest first.
pub type RawBars = Vec<Bar>;

/// Divergence/MA class for a single lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryClass {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for SummaryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SummaryClass::Bullish => "bullish",
            SummaryClass::Bearish => "bearish",
            SummaryClass::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

/// The lookback windows (trading days) every `SummaryStates` must carry.
pub const LOOKBACK_WINDOWS: [u32; 5] = [1, 3, 7, 14, 28];

/// Mapping from lookback-window length to divergence class. Invariant:
/// every window in [`LOOKBACK_WINDOWS`] is present; missing history yields
/// all-neutral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStates {
    pub classes: BTreeMap<u32, SummaryClass>,
}

impl SummaryStates {
    /// Build an all-neutral summary (used when history is insufficient).
    pub fn all_neutral() -> Self {
        let classes = LOOKBACK_WINDOWS
            .iter()
            .map(|&w| (w, SummaryClass::Neutral))
            .collect();
        Self { classes }
    }

    /// Build from an explicit per-window mapping, filling any missing window
    /// with `Neutral` to preserve the invariant.
    pub fn from_map(mut classes: BTreeMap<u32, SummaryClass>) -> Self {
        for &w in &LOOKBACK_WINDOWS {
            classes.entry(w).or_insert(SummaryClass::Neutral);
        }
        Self { classes }
    }

    pub fn get(&self, window: u32) -> SummaryClass {
        self.classes.get(&window).copied().unwrap_or(SummaryClass::Neutral)
    }
}

/// Optional moving-average-above-price flags, set only when MA enrichment
/// ran for this ticker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaPositions {
    pub ma8_above: Option<bool>,
    pub ma21_above: Option<bool>,
    pub ma50_above: Option<bool>,
    pub ma200_above: Option<bool>,
}

/// A row describing the latest bar for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestBarRow {
    pub ticker: String,
    pub source_interval: SourceInterval,
    pub trade_date: chrono::NaiveDate,
    pub close: f64,
    pub prev_close: f64,
    pub volume_delta: f64,
}

/// A per-ticker, per-source-interval summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub ticker: String,
    pub source_interval: SourceInterval,
    pub trade_date: chrono::NaiveDate,
    pub states: SummaryStates,
    pub ma: MaPositions,
}

/// One-timeframe trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    OneDay,
    OneWeek,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::OneDay => write!(f, "1d"),
            Timeframe::OneWeek => write!(f, "1w"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub ticker: String,
    pub signal_type: SummaryClass,
    pub trade_date: chrono::NaiveDate,
    pub price: f64,
    pub prev_close: f64,
    pub volume_delta: f64,
    pub timeframe: Timeframe,
    pub source_interval: SourceInterval,
}

/// A neutral marker: triggers deletion of any prior signal for
/// `(ticker, trade_date)` rather than an upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeutralMarker {
    pub ticker: String,
    pub trade_date: chrono::NaiveDate,
    pub timeframe: Timeframe,
    pub source_interval: SourceInterval,
}

/// A per-day history row used for backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub ticker: String,
    pub source_interval: SourceInterval,
    pub trade_date: chrono::NaiveDate,
    pub close: f64,
    pub prev_close: f64,
    pub volume_delta: f64,
}

/// The reason a per-ticker work unit produced no rows without being an
/// error (e.g. the provider holds no history for a freshly-listed symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedReason(pub String);

/// The non-error-kind payload of a settled per-ticker work unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerSuccess {
    pub latest_bar: Option<LatestBarRow>,
    pub summary: Option<SummaryRow>,
    pub signal: Option<SignalRow>,
    pub neutral_marker: Option<NeutralMarker>,
    pub history: Vec<HistoryRow>,
}

/// The settled result of one per-ticker work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TickerOutcome {
    Success(TickerSuccess),
    Skipped(SkippedReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_validation_accepts_plain_symbols() {
        assert_eq!(validate_ticker("aapl"), Some("AAPL".to_string()));
        assert_eq!(validate_ticker("BRK.B"), Some("BRK.B".to_string()));
        assert_eq!(validate_ticker("BF-B"), Some("BF-B".to_string()));
    }

    #[test]
    fn ticker_validation_rejects_bad_symbols() {
        assert_eq!(validate_ticker(""), None);
        assert_eq!(validate_ticker("1AAPL"), None);
        assert_eq!(validate_ticker("AAPL!"), None);
        assert_eq!(validate_ticker(&"A".repeat(20)), None);
    }

    #[test]
    fn scan_program_round_trips_through_display() {
        for p in [
            ScanProgram::FetchDaily,
            ScanProgram::FetchWeekly,
            ScanProgram::AccumulationScan,
            ScanProgram::DetectorScan,
        ] {
            let s = p.to_string();
            assert_eq!(s.parse::<ScanProgram>().unwrap(), p);
        }
    }

    #[test]
    fn summary_states_all_neutral_carries_every_window() {
        let s = SummaryStates::all_neutral();
        for w in LOOKBACK_WINDOWS {
            assert_eq!(s.get(w), SummaryClass::Neutral);
        }
    }

    #[test]
    fn summary_states_from_map_fills_missing_windows() {
        let mut classes = BTreeMap::new();
        classes.insert(1, SummaryClass::Bullish);
        let s = SummaryStates::from_map(classes);
        assert_eq!(s.get(1), SummaryClass::Bullish);
        assert_eq!(s.get(3), SummaryClass::Neutral);
        assert_eq!(s.get(28), SummaryClass::Neutral);
    }

    #[test]
    fn detector_scan_has_hard_memory_ceiling() {
        assert_eq!(ScanProgram::DetectorScan.memory_class_ceiling(), Some(3));
        assert_eq!(ScanProgram::FetchDaily.memory_class_ceiling(), None);
    }
}
