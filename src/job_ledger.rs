// =============================================================================
// Scan Job Ledger — per-run job record
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

/// Fields updatable at a checkpoint or terminal transition. `notes` carries
/// the JSON-encoded resume snapshot; `None` leaves the column
/// untouched, `Some(None)` clears it.
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub status: Option<String>,
    pub processed_symbols: Option<i64>,
    pub error_count: Option<i64>,
    pub bullish_count: Option<i64>,
    pub bearish_count: Option<i64>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notes: Option<Option<String>>,
}

pub struct JobLedger {
    pool: PgPool,
}

impl JobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_run(
        &self,
        program: &str,
        run_for_date: NaiveDate,
        total_symbols: i64,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scan_jobs
                (id, program, run_for_date, status, started_at, total_symbols, processed_symbols,
                 bullish_count, bearish_count, error_count, notes)
            VALUES ($1, $2, $3, 'running', now(), $4, 0, 0, 0, 0, NULL)
            "#,
        )
        .bind(id)
        .bind(program)
        .bind(run_for_date)
        .bind(total_symbols)
        .execute(&self.pool)
        .await
        .context("failed to insert scan job")?;
        Ok(id)
    }

    pub async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<()> {
        if let Some(status) = &update.status {
            sqlx::query("UPDATE scan_jobs SET status = $2 WHERE id = $1")
                .bind(job_id)
                .bind(status)
                .execute(&self.pool)
                .await
                .context("failed to update scan job status")?;
        }
        if let Some(processed) = update.processed_symbols {
            sqlx::query("UPDATE scan_jobs SET processed_symbols = $2 WHERE id = $1")
                .bind(job_id)
                .bind(processed)
                .execute(&self.pool)
                .await
                .context("failed to update scan job progress")?;
        }
        if let Some(errors) = update.error_count {
            sqlx::query("UPDATE scan_jobs SET error_count = $2 WHERE id = $1")
                .bind(job_id)
                .bind(errors)
                .execute(&self.pool)
                .await
                .context("failed to update scan job error count")?;
        }
        if let Some(finished_at) = update.finished_at {
            sqlx::query("UPDATE scan_jobs SET finished_at = $2 WHERE id = $1")
                .bind(job_id)
                .bind(finished_at)
                .execute(&self.pool)
                .await
                .context("failed to set scan job finished_at")?;
        }
        if let Some(notes) = update.notes {
            sqlx::query("UPDATE scan_jobs SET notes = $2 WHERE id = $1")
                .bind(job_id)
                .bind(notes)
                .execute(&self.pool)
                .await
                .context("failed to update scan job notes")?;
        }
        Ok(())
    }

    pub async fn load_notes(&self, job_id: Uuid) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT notes FROM scan_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read scan job notes")?;
        Ok(row.and_then(|(n,)| n))
    }

    /// Most recent job for a program, used to rehydrate a resume snapshot
    /// without the caller tracking the job id across process restarts.
    pub async fn latest_job_notes(&self, program: &str) -> Result<Option<(Uuid, Option<String>)>> {
        let row: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, notes FROM scan_jobs
            WHERE program = $1 AND status != 'completed'
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(program)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read latest scan job")?;
        Ok(row)
    }
}
