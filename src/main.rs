// =============================================================================
// Scan Engine — Main Entry Point
// =============================================================================
//
// Runs every scan program once per invocation, in the sequence fetch-daily,
// fetch-weekly, accumulation-scan, detector-scan, honoring a resume snapshot
// for each program if one exists. A Ctrl+C during a run requests a stop on
// whichever program is currently in flight and lets it persist its resume
// state before exiting.
// =============================================================================

use std::sync::Arc;

use scan_engine::config::ScanEngineConfig;
use scan_engine::orchestrator::RunOptions;
use scan_engine::store;
use scan_engine::types::ScanProgram;
use scan_engine::EngineHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RUN_SEQUENCE: [ScanProgram; 4] = [
    ScanProgram::FetchDaily,
    ScanProgram::FetchWeekly,
    ScanProgram::AccumulationScan,
    ScanProgram::DetectorScan,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("scan engine starting");

    let config = ScanEngineConfig::from_env();
    if config.api_key.is_none() {
        warn!("DATA_API_KEY not set — every fetch will fail with Paused");
    }

    let Some(database_url) = config.database_url.clone() else {
        error!("DATABASE_URL not set — nothing to scan against, exiting");
        return Ok(());
    };

    let pool = store::connect(&database_url).await?;
    let engine = Arc::new(EngineHandle::new(config, pool));

    let resume = std::env::var("SCAN_RESUME").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);

    for program in RUN_SEQUENCE {
        let engine = engine.clone();
        let run = tokio::spawn(async move {
            let options = RunOptions { resume, trigger: "scheduled".to_string(), ..Default::default() };
            engine.start_run(program, options).await
        });

        tokio::select! {
            result = run => {
                match result {
                    Ok(Ok(outcome)) => info!(%program, ?outcome, "program finished"),
                    Ok(Err(e)) => error!(%program, error = %e, "program failed"),
                    Err(join_err) => error!(%program, error = %join_err, "program task panicked"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(%program, "shutdown signal received — requesting stop");
                engine.request_stop(program);
                break;
            }
        }
    }

    info!("scan engine shut down complete");
    Ok(())
}
