// =============================================================================
// Scan Engine — library root
// =============================================================================

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fanout;
pub mod flusher;
pub mod http;
pub mod job_ledger;
pub mod metrics;
pub mod orchestrator;
pub mod programs;
pub mod publication;
pub mod rate_limiter;
pub mod resume;
pub mod retry;
pub mod scan_state;
pub mod store;
pub mod types;
pub mod universe;
pub mod watchdog;

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::postgres::PgPool;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ScanEngineConfig;
use crate::http::HttpFetcher;
use crate::metrics::RunMetricsSnapshot;
use crate::orchestrator::{RunOptions, RunResult, ScanOrchestrator};
use crate::rate_limiter::RateLimiter;
use crate::scan_state::{ScanState, StatusSnapshot};
use crate::types::ScanProgram;

const ALL_PROGRAMS: [ScanProgram; 4] = [
    ScanProgram::FetchDaily,
    ScanProgram::FetchWeekly,
    ScanProgram::AccumulationScan,
    ScanProgram::DetectorScan,
];

/// Cheaply-`Clone`-able façade over one `ScanOrchestrator`/`ScanState` pair
/// per program. Every program shares the same
/// `HttpFetcher`, rate limiter, and circuit breaker, since they all draw
/// from the same provider budget.
#[derive(Clone)]
pub struct EngineHandle {
    config: Arc<ScanEngineConfig>,
    orchestrators: Arc<HashMap<ScanProgram, ScanOrchestrator>>,
}

impl EngineHandle {
    pub fn new(config: ScanEngineConfig, pool: PgPool) -> Self {
        let config = Arc::new(config);
        let rate_limiter = RateLimiter::new(config.rate_bucket_capacity, config.max_requests_per_second);
        let circuit_breaker = CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown_ms);
        let fetcher = Arc::new(HttpFetcher::new(config.api_key.clone(), rate_limiter, circuit_breaker));

        let orchestrators = ALL_PROGRAMS
            .into_iter()
            .map(|program| {
                let state = ScanState::new(program);
                let orchestrator = ScanOrchestrator::new(program, config.clone(), state, fetcher.clone(), pool.clone());
                (program, orchestrator)
            })
            .collect();

        Self {
            config,
            orchestrators: Arc::new(orchestrators),
        }
    }

    fn orchestrator(&self, program: ScanProgram) -> &ScanOrchestrator {
        self.orchestrators
            .get(&program)
            .expect("every ScanProgram variant has an orchestrator")
    }

    /// Start a run for `program`. Returns immediately after admission is
    /// resolved and the run has completed or been rejected — there is no
    /// separate "background job" concept here; the caller decides whether to
    /// `tokio::spawn` this.
    pub async fn start_run(&self, program: ScanProgram, options: RunOptions) -> anyhow::Result<RunResult> {
        self.orchestrator(program).run_program(options).await
    }

    pub fn request_stop(&self, program: ScanProgram) -> bool {
        self.orchestrator(program).state().request_stop()
    }

    pub fn request_pause(&self, program: ScanProgram) -> bool {
        self.orchestrator(program).state().request_pause()
    }

    pub fn get_status(&self, program: ScanProgram) -> StatusSnapshot {
        self.orchestrator(program).state().get_status()
    }

    pub fn get_metrics(&self, program: ScanProgram) -> Option<RunMetricsSnapshot> {
        self.orchestrator(program).last_metrics()
    }

    pub fn config(&self) -> &ScanEngineConfig {
        &self.config
    }
}
