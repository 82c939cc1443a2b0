// =============================================================================
// Store — Postgres connection pool setup
// =============================================================================
//
// Schema migration and pool tuning live outside this core;
// this module only builds the pool the other store-facing modules share.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    info!("connecting to relational store");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to the relational store")
}
