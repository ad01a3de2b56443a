//! Postgres-backed workflow history store.
//!
//! Two tables: `workflow_instances` (one row per instance, status serialized as
//! JSONB next to a plain `status` column used for polling) and
//! `workflow_steps` (append-only, primary key `(instance_id, step_index)`).
//! Step appends lock the instance row and check the expected index inside a
//! transaction; the primary key turns any remaining race into a `Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use billrun_core::{InstanceId, StoreError, StoreResult};
use billrun_workflow::{StepKind, StepOutcome, StepRecord, WorkflowInstance, WorkflowStatus};

use crate::db::map_sqlx_error;

use super::store::HistoryStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_instances (
        instance_id       TEXT PRIMARY KEY,
        orchestrator_kind TEXT NOT NULL,
        input             JSONB NOT NULL,
        status            TEXT NOT NULL,
        status_detail     JSONB NOT NULL,
        parent_id         TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS workflow_instances_runnable
        ON workflow_instances (created_at, instance_id)
        WHERE status = 'running' AND parent_id IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_steps (
        instance_id  TEXT NOT NULL REFERENCES workflow_instances (instance_id),
        step_index   INTEGER NOT NULL CHECK (step_index >= 0),
        kind         TEXT NOT NULL,
        type_tag     TEXT NOT NULL,
        input        JSONB NOT NULL,
        attempts     INTEGER NOT NULL,
        outcome      JSONB NOT NULL,
        completed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (instance_id, step_index)
    )
    "#,
];

/// History store shared by every dispatcher process.
#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_instance_row(&self, instance_id: &InstanceId) -> StoreResult<Option<PgRow>> {
        sqlx::query(
            r#"
            SELECT instance_id, orchestrator_kind, input, status_detail, parent_id, created_at, updated_at
            FROM workflow_instances
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_instance", e))
    }

    async fn load_steps(&self, instance_id: &InstanceId) -> StoreResult<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT step_index, kind, type_tag, input, attempts, outcome, completed_at
            FROM workflow_steps
            WHERE instance_id = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        rows.iter().map(step_from_row).collect()
    }

    async fn lock_status(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &InstanceId,
        operation: &str,
    ) -> StoreResult<String> {
        let row = sqlx::query("SELECT status FROM workflow_instances WHERE instance_id = $1 FOR UPDATE")
            .bind(instance_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or_else(|| StoreError::not_found(format!("workflow instance {instance_id}")))?;

        row.try_get("status").map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_workflow_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, input), fields(instance_id = %instance_id), err)]
    async fn create_instance(
        &self,
        instance_id: &InstanceId,
        orchestrator_kind: &str,
        input: JsonValue,
        parent_id: Option<&InstanceId>,
    ) -> StoreResult<(WorkflowInstance, bool)> {
        let status = WorkflowStatus::Running;
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (instance_id, orchestrator_kind, input, status, status_detail, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (instance_id) DO NOTHING
            RETURNING instance_id, orchestrator_kind, input, status_detail, parent_id, created_at, updated_at
            "#,
        )
        .bind(instance_id.as_str())
        .bind(orchestrator_kind)
        .bind(&input)
        .bind(status.name())
        .bind(to_json(&status)?)
        .bind(parent_id.map(InstanceId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_instance", e))?;

        if let Some(row) = inserted {
            return Ok((instance_from_row(&row, Vec::new())?, true));
        }

        let existing = self
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| StoreError::transient(format!("workflow instance {instance_id} vanished after insert conflict")))?;
        Ok((existing, false))
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn get_instance(&self, instance_id: &InstanceId) -> StoreResult<Option<WorkflowInstance>> {
        let Some(row) = self.fetch_instance_row(instance_id).await? else {
            return Ok(None);
        };
        let history = self.load_steps(instance_id).await?;
        instance_from_row(&row, history).map(Some)
    }

    #[instrument(skip(self, record), fields(instance_id = %instance_id, step_index = record.step_index), err)]
    async fn append_step(&self, instance_id: &InstanceId, record: &StepRecord) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let status = Self::lock_status(&mut tx, instance_id, "append_step").await?;
        if status != WorkflowStatus::Running.name() {
            return Err(StoreError::conflict(format!("workflow instance {instance_id} is {status}")));
        }

        let next: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_steps WHERE instance_id = $1")
            .bind(instance_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_steps", e))?;
        if next != i64::from(record.step_index) {
            return Err(StoreError::conflict(format!(
                "workflow instance {instance_id} expects step {next}, got {}",
                record.step_index
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (instance_id, step_index, kind, type_tag, input, attempts, outcome, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance_id.as_str())
        .bind(to_i32(record.step_index)?)
        .bind(record.kind.as_str())
        .bind(&record.type_tag)
        .bind(&record.input)
        .bind(to_i32(record.attempts)?)
        .bind(to_json(&record.outcome)?)
        .bind(record.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_step", e))?;

        sqlx::query("UPDATE workflow_instances SET updated_at = now() WHERE instance_id = $1")
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("touch_instance", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, status), fields(instance_id = %instance_id, status = status.name()), err)]
    async fn set_status(&self, instance_id: &InstanceId, status: &WorkflowStatus) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = Self::lock_status(&mut tx, instance_id, "set_status").await?;
        if current != WorkflowStatus::Running.name() {
            return Err(StoreError::conflict(format!(
                "workflow instance {instance_id} is already {current}"
            )));
        }

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2, status_detail = $3, updated_at = now()
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id.as_str())
        .bind(status.name())
        .bind(to_json(status)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn load_history(&self, instance_id: &InstanceId) -> StoreResult<Vec<StepRecord>> {
        if self.fetch_instance_row(instance_id).await?.is_none() {
            return Err(StoreError::not_found(format!("workflow instance {instance_id}")));
        }
        self.load_steps(instance_id).await
    }

    #[instrument(skip(self), err)]
    async fn list_runnable(&self, limit: usize) -> StoreResult<Vec<InstanceId>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT instance_id
            FROM workflow_instances
            WHERE status = 'running' AND parent_id IS NULL
            ORDER BY created_at ASC, instance_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_runnable", e))?;

        Ok(ids.into_iter().map(InstanceId::new).collect())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<JsonValue> {
    serde_json::to_value(value).map_err(|e| StoreError::transient(format!("encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: JsonValue, what: &str) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::transient(format!("decode {what}: {e}")))
}

fn to_i32(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::conflict(format!("value {value} out of range")))
}

fn instance_from_row(row: &PgRow, history: Vec<StepRecord>) -> StoreResult<WorkflowInstance> {
    let decode = |e| map_sqlx_error("decode_instance", e);
    let instance_id: String = row.try_get("instance_id").map_err(decode)?;
    let orchestrator_kind: String = row.try_get("orchestrator_kind").map_err(decode)?;
    let input: JsonValue = row.try_get("input").map_err(decode)?;
    let status: JsonValue = row.try_get("status_detail").map_err(decode)?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(WorkflowInstance {
        instance_id: InstanceId::new(instance_id),
        orchestrator_kind,
        input,
        history,
        status: from_json(status, "status")?,
        parent_id: parent_id.map(InstanceId::new),
        created_at,
        updated_at,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<StepRecord> {
    let decode = |e| map_sqlx_error("decode_step", e);
    let step_index: i32 = row.try_get("step_index").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let type_tag: String = row.try_get("type_tag").map_err(decode)?;
    let input: JsonValue = row.try_get("input").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let outcome: JsonValue = row.try_get("outcome").map_err(decode)?;
    let completed_at: DateTime<Utc> = row.try_get("completed_at").map_err(decode)?;

    Ok(StepRecord {
        step_index: u32::try_from(step_index).unwrap_or_default(),
        kind: from_json::<StepKind>(JsonValue::String(kind), "step kind")?,
        type_tag,
        input,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        outcome: from_json::<StepOutcome>(outcome, "step outcome")?,
        completed_at,
    })
}
