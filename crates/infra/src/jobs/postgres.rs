//! Postgres-backed lease store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use billrun_core::{JobName, StoreError, StoreResult};

use crate::db::map_sqlx_error;

use super::store::LeaseStore;
use super::types::JobLeaseRecord;

/// Lease store shared by every worker process through one `job_leases` table.
///
/// The upsert is a single statement whose `ON CONFLICT` branch only applies
/// when it does not move `last_executed` backwards; a losing writer gets no row
/// back and reports `Conflict`. Reading the lease and writing it remain two
/// separate statements, so two processes that both read an eligible lease can
/// both run the same cycle.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_leases (
                name            TEXT PRIMARY KEY,
                last_executed   TIMESTAMPTZ NOT NULL,
                execution_count BIGINT NOT NULL CHECK (execution_count >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_job_leases", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job = %name), err)]
    async fn get_lease(&self, name: &JobName) -> StoreResult<Option<JobLeaseRecord>> {
        let row = sqlx::query(
            r#"
            SELECT name, last_executed, execution_count
            FROM job_leases
            WHERE name = $1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lease", e))?;

        row.map(|row| lease_from_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(job = %name), err)]
    async fn upsert_lease(
        &self,
        name: &JobName,
        last_executed: DateTime<Utc>,
        execution_count: u64,
    ) -> StoreResult<JobLeaseRecord> {
        let count = i64::try_from(execution_count)
            .map_err(|_| StoreError::conflict(format!("execution count {execution_count} out of range")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO job_leases (name, last_executed, execution_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET last_executed = EXCLUDED.last_executed,
                    execution_count = EXCLUDED.execution_count
                WHERE job_leases.last_executed <= EXCLUDED.last_executed
            RETURNING name, last_executed, execution_count
            "#,
        )
        .bind(name.as_str())
        .bind(last_executed)
        .bind(count)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_lease", e))?;

        match row {
            Some(row) => lease_from_row(&row),
            None => Err(StoreError::conflict(format!(
                "lease for '{name}' already advanced past {last_executed}"
            ))),
        }
    }
}

fn lease_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<JobLeaseRecord> {
    let decode = |e| map_sqlx_error("decode_lease", e);
    let name: String = row.try_get("name").map_err(decode)?;
    let last_executed: DateTime<Utc> = row.try_get("last_executed").map_err(decode)?;
    let execution_count: i64 = row.try_get("execution_count").map_err(decode)?;

    Ok(JobLeaseRecord {
        name: JobName::new(name),
        last_executed,
        execution_count: u64::try_from(execution_count).unwrap_or_default(),
    })
}
