// =============================================================================
// Publication State — latest published trade date per source interval
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::types::SourceInterval;

pub struct PublicationStore {
    pool: PgPool,
}

impl PublicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent monotonic upsert: stores `max(stored, incoming)`. Never regresses the published date.
    pub async fn publish(
        &self,
        source_interval: SourceInterval,
        trade_date: NaiveDate,
        scan_job_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publication_state (source_interval, published_trade_date, last_scan_job_id, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (source_interval)
            DO UPDATE SET published_trade_date = GREATEST(publication_state.published_trade_date, EXCLUDED.published_trade_date),
                          last_scan_job_id = EXCLUDED.last_scan_job_id,
                          updated_at = now()
            "#,
        )
        .bind(source_interval.to_string())
        .bind(trade_date)
        .bind(scan_job_id)
        .execute(&self.pool)
        .await
        .context("failed to upsert publication state")?;
        Ok(())
    }

    pub async fn get_published(&self, source_interval: SourceInterval) -> Result<Option<NaiveDate>> {
        let row: Option<(NaiveDate,)> = sqlx::query_as(
            "SELECT published_trade_date FROM publication_state WHERE source_interval = $1",
        )
        .bind(source_interval.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to read publication state")?;
        Ok(row.map(|(d,)| d))
    }
}
