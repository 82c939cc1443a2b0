// =============================================================================
// Universe Provider — ticker list for a run
// =============================================================================

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use sqlx::postgres::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::FetchErrorKind;
use crate::http::HttpFetcher;

/// A directory-fetch collaborator, boxed the same way `orchestrator::worker_fn`
/// boxes its per-item futures so `UniverseProvider` doesn't need to know
/// which upstream backs it.
pub type DirectoryFetchFn = dyn Fn() -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send>> + Send + Sync;

/// Returns active tickers from the store; if below `min_floor`, bootstraps
/// more from an upstream directory client and upserts them. The
/// directory client is injected so this module has no opinion on which
/// upstream is used.
pub struct UniverseProvider {
    pool: PgPool,
    min_floor: usize,
}

impl UniverseProvider {
    pub fn new(pool: PgPool, min_floor: usize) -> Self {
        Self { pool, min_floor }
    }

    /// Stable-sorted list of active tickers. `refresh` additionally fetches
    /// and upserts a fresh candidate set via `directory_fetch` before
    /// re-reading, regardless of the current floor.
    pub async fn tickers(&self, refresh: bool, directory_fetch: Option<&DirectoryFetchFn>) -> Result<Vec<String>> {
        if refresh {
            if let Some(fetch) = directory_fetch {
                let candidates = fetch().await?;
                self.upsert_symbols(&candidates).await?;
            }
        }

        let mut tickers = self.active_tickers().await?;

        if tickers.len() < self.min_floor {
            warn!(
                count = tickers.len(),
                floor = self.min_floor,
                "universe below minimum floor — bootstrapping from directory"
            );
            if let Some(fetch) = directory_fetch {
                let candidates = fetch().await?;
                self.upsert_symbols(&candidates).await?;
                tickers = self.active_tickers().await?;
            }
        }

        tickers.sort();
        info!(count = tickers.len(), "universe loaded");
        Ok(tickers)
    }

    async fn active_tickers(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT ticker FROM symbols WHERE is_active = true")
            .fetch_all(&self.pool)
            .await
            .context("failed to read active symbols")?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn upsert_symbols(&self, tickers: &[String]) -> Result<()> {
        for ticker in tickers {
            sqlx::query(
                r#"
                INSERT INTO symbols (ticker, is_active, updated_at)
                VALUES ($1, true, now())
                ON CONFLICT (ticker) DO UPDATE SET is_active = true, updated_at = now()
                "#,
            )
            .bind(ticker)
            .execute(&self.pool)
            .await
            .context("failed to upsert symbol")?;
        }
        Ok(())
    }
}

/// Fetches the full active-ticker directory from the upstream reference
/// endpoint. Used as the `directory_fetch` collaborator passed to
/// `UniverseProvider::tickers`.
pub async fn fetch_directory_tickers(
    fetcher: &HttpFetcher,
    base_url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>, FetchErrorKind> {
    let url = format!("{base_url}/v3/reference/tickers?market=stocks&active=true&limit=1000");
    let rows = fetcher.fetch_array_with_fallback("ticker-directory", &[url], cancel).await?;
    Ok(rows
        .iter()
        .filter_map(|v| v.get("ticker").and_then(|t| t.as_str()).map(|s| s.to_string()))
        .collect())
}
