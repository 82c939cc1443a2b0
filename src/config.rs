// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// All tunables carry a `default_*` helper so that `ScanEngineConfig::default()`
// and `from_env()` always agree on baseline values; `from_env` only overrides
// a field when the corresponding environment variable parses successfully.
// =============================================================================

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_requests_per_second() -> f64 {
    99.0
}

fn default_rate_bucket_capacity() -> f64 {
    99.0
}

fn default_requests_paused() -> bool {
    false
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

fn default_ticker_timeout_ms() -> u64 {
    180_000
}

fn default_stall_timeout_ms() -> u64 {
    90_000
}

fn default_stall_max_retries() -> u32 {
    3
}

fn default_fetch_daily_concurrency() -> usize {
    12
}

fn default_fetch_weekly_concurrency() -> usize {
    12
}

fn default_accumulation_scan_concurrency() -> usize {
    12
}

fn default_detector_scan_concurrency() -> usize {
    3
}

fn default_summary_build_concurrency() -> usize {
    8
}

fn default_fetch_run_summary_flush_size() -> usize {
    200
}

fn default_summary_upsert_batch_size() -> usize {
    200
}

fn default_source_interval() -> String {
    "1min".to_string()
}

fn default_universe_min_floor() -> usize {
    100
}

/// Process-lifetime engine configuration, loaded once at startup from the
/// environment. Every field has a sane default so a bare environment
/// still produces a runnable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEngineConfig {
    /// Absent in the environment means every call fails `Paused`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,

    #[serde(default = "default_rate_bucket_capacity")]
    pub rate_bucket_capacity: f64,

    #[serde(default = "default_requests_paused")]
    pub requests_paused: bool,

    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    #[serde(default = "default_ticker_timeout_ms")]
    pub ticker_timeout_ms: u64,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default = "default_stall_max_retries")]
    pub stall_max_retries: u32,

    #[serde(default = "default_fetch_daily_concurrency")]
    pub fetch_daily_concurrency: usize,

    #[serde(default = "default_fetch_weekly_concurrency")]
    pub fetch_weekly_concurrency: usize,

    #[serde(default = "default_accumulation_scan_concurrency")]
    pub accumulation_scan_concurrency: usize,

    #[serde(default = "default_detector_scan_concurrency")]
    pub detector_scan_concurrency: usize,

    #[serde(default = "default_summary_build_concurrency")]
    pub summary_build_concurrency: usize,

    #[serde(default = "default_fetch_run_summary_flush_size")]
    pub fetch_run_summary_flush_size: usize,

    #[serde(default = "default_summary_upsert_batch_size")]
    pub summary_upsert_batch_size: usize,

    #[serde(default = "default_source_interval")]
    pub source_interval: String,

    #[serde(default = "default_universe_min_floor")]
    pub universe_min_floor: usize,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub provider_base_url: Option<String>,
}

impl Default for ScanEngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            max_requests_per_second: default_max_requests_per_second(),
            rate_bucket_capacity: default_rate_bucket_capacity(),
            requests_paused: default_requests_paused(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            ticker_timeout_ms: default_ticker_timeout_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            stall_max_retries: default_stall_max_retries(),
            fetch_daily_concurrency: default_fetch_daily_concurrency(),
            fetch_weekly_concurrency: default_fetch_weekly_concurrency(),
            accumulation_scan_concurrency: default_accumulation_scan_concurrency(),
            detector_scan_concurrency: default_detector_scan_concurrency(),
            summary_build_concurrency: default_summary_build_concurrency(),
            fetch_run_summary_flush_size: default_fetch_run_summary_flush_size(),
            summary_upsert_batch_size: default_summary_upsert_batch_size(),
            source_interval: default_source_interval(),
            universe_min_floor: default_universe_min_floor(),
            database_url: None,
            provider_base_url: None,
        }
    }
}

impl ScanEngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything absent or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.api_key = env::var("DATA_API_KEY").ok().filter(|v| !v.is_empty());
        cfg.database_url = env::var("DATABASE_URL").ok();
        cfg.provider_base_url = env::var("DATA_API_BASE_URL").ok();

        if let Some(v) = env_f64("DATA_API_MAX_REQUESTS_PER_SECOND") {
            cfg.max_requests_per_second = v;
        }
        cfg.rate_bucket_capacity =
            env_f64("DATA_API_RATE_BUCKET_CAPACITY").unwrap_or(cfg.max_requests_per_second);

        if let Some(v) = env_bool("DATA_API_REQUESTS_PAUSED") {
            cfg.requests_paused = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_FETCH_DAILY_CONCURRENCY") {
            cfg.fetch_daily_concurrency = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_FETCH_WEEKLY_CONCURRENCY") {
            cfg.fetch_weekly_concurrency = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_ACCUMULATION_SCAN_CONCURRENCY") {
            cfg.accumulation_scan_concurrency = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_DETECTOR_SCAN_CONCURRENCY") {
            cfg.detector_scan_concurrency = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_SUMMARY_BUILD_CONCURRENCY") {
            cfg.summary_build_concurrency = v;
        }
        if let Some(v) = env_u64("DIVERGENCE_FETCH_TICKER_TIMEOUT_MS") {
            cfg.ticker_timeout_ms = v;
        }
        if let Some(v) = env_u64("DIVERGENCE_STALL_TIMEOUT_MS") {
            cfg.stall_timeout_ms = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_STALL_MAX_RETRIES") {
            cfg.stall_max_retries = v as u32;
        }
        if let Some(v) = env_usize("DIVERGENCE_FETCH_RUN_SUMMARY_FLUSH_SIZE") {
            cfg.fetch_run_summary_flush_size = v;
        }
        if let Some(v) = env_usize("DIVERGENCE_SUMMARY_UPSERT_BATCH_SIZE") {
            cfg.summary_upsert_batch_size = v;
        }
        if let Ok(v) = env::var("DIVERGENCE_SOURCE_INTERVAL") {
            cfg.source_interval = v;
        }

        cfg
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn ticker_timeout(&self) -> Duration {
        Duration::from_millis(self.ticker_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Configured concurrency ceiling for a program, before the adaptive
    /// calculation and per-program memory-class clamp are applied.
    pub fn configured_concurrency(&self, program: crate::types::ScanProgram) -> usize {
        use crate::types::ScanProgram::*;
        match program {
            FetchDaily => self.fetch_daily_concurrency,
            FetchWeekly => self.fetch_weekly_concurrency,
            AccumulationScan => self.accumulation_scan_concurrency,
            DetectorScan => self.detector_scan_concurrency,
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|v| match v.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = ScanEngineConfig::default();
        assert_eq!(cfg.max_requests_per_second, 99.0);
        assert_eq!(cfg.circuit_breaker_threshold, 5);
        assert_eq!(cfg.circuit_breaker_cooldown_ms, 30_000);
        assert_eq!(cfg.stall_timeout_ms, 90_000);
        assert_eq!(cfg.detector_scan_concurrency, 3);
    }

    #[test]
    fn configured_concurrency_dispatches_by_program() {
        let mut cfg = ScanEngineConfig::default();
        cfg.detector_scan_concurrency = 3;
        cfg.fetch_daily_concurrency = 20;
        assert_eq!(cfg.configured_concurrency(crate::types::ScanProgram::DetectorScan), 3);
        assert_eq!(cfg.configured_concurrency(crate::types::ScanProgram::FetchDaily), 20);
    }
}
