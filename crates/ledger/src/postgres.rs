use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OperationKey, RunId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    LedgerError, Result,
    entry::{ResourceKind, ResourceLedgerEntry, ResourceStatus},
    run::{RunStatus, StepRecord, WorkflowRun},
    store::{Admission, ProvisionStore},
};

/// PostgreSQL-backed provisioning store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_run(row: PgRow) -> Result<WorkflowRun> {
        let status_str: String = row.try_get("status")?;
        let status = RunStatus::parse(&status_str).ok_or(LedgerError::InvalidColumn {
            field: "status",
            value: status_str,
        })?;

        let params_json: serde_json::Value = row.try_get("params")?;
        let params: BTreeMap<String, String> = serde_json::from_value(params_json)?;

        let steps_json: serde_json::Value = row.try_get("steps")?;
        let steps: Vec<StepRecord> = serde_json::from_value(steps_json)?;

        Ok(WorkflowRun {
            id: RunId::from_uuid(row.try_get::<Uuid, _>("id")?),
            workflow: row.try_get("workflow")?,
            operation_key: OperationKey::from(row.try_get::<String, _>("operation_key")?),
            params,
            steps,
            status,
            cancel_requested: row.try_get("cancel_requested")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_entry(row: PgRow) -> Result<ResourceLedgerEntry> {
        let kind_str: String = row.try_get("kind")?;
        let kind = ResourceKind::parse(&kind_str).ok_or(LedgerError::InvalidColumn {
            field: "kind",
            value: kind_str,
        })?;

        let status_str: String = row.try_get("status")?;
        let status = ResourceStatus::parse(&status_str).ok_or(LedgerError::InvalidColumn {
            field: "status",
            value: status_str,
        })?;

        Ok(ResourceLedgerEntry {
            kind,
            natural_key: row.try_get("natural_key")?,
            status,
            run_id: RunId::from_uuid(row.try_get::<Uuid, _>("run_id")?),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }

    async fn upsert_run(&self, run: &WorkflowRun) -> Result<()> {
        let params = serde_json::to_value(&run.params)?;
        let steps = serde_json::to_value(&run.steps)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow, operation_key, status, cancel_requested, params, steps, result, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                cancel_requested = EXCLUDED.cancel_requested,
                steps = EXCLUDED.steps,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(&run.workflow)
        .bind(run.operation_key.as_str())
        .bind(run.status.as_str())
        .bind(run.cancel_requested)
        .bind(params)
        .bind(steps)
        .bind(&run.result)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProvisionStore for PostgresStore {
    async fn admit(&self, run: WorkflowRun) -> Result<Admission> {
        let mut tx = self.pool.begin().await?;

        // A prior successful run for the key short-circuits with its result.
        let completed: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, result FROM workflow_runs
            WHERE operation_key = $1 AND status = 'succeeded'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(run.operation_key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = completed {
            return Ok(Admission::AlreadyCompleted {
                run_id: RunId::from_uuid(row.try_get::<Uuid, _>("id")?),
                result: row.try_get("result")?,
            });
        }

        // The partial unique index on (operation_key) WHERE status='running'
        // arbitrates concurrent admissions.
        let params = serde_json::to_value(&run.params)?;
        let steps = serde_json::to_value(&run.steps)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow, operation_key, status, cancel_requested, params, steps, result, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (operation_key) WHERE status = 'running' DO NOTHING
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(&run.workflow)
        .bind(run.operation_key.as_str())
        .bind(run.status.as_str())
        .bind(run.cancel_requested)
        .bind(params)
        .bind(steps)
        .bind(&run.result)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let holder: PgRow = sqlx::query(
                r#"
                SELECT id FROM workflow_runs
                WHERE operation_key = $1 AND status = 'running'
                LIMIT 1
                "#,
            )
            .bind(run.operation_key.as_str())
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(Admission::AlreadyInFlight(RunId::from_uuid(
                holder.try_get::<Uuid, _>("id")?,
            )));
        }

        tx.commit().await?;
        Ok(Admission::AdmittedNew(run.id))
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.upsert_run(run).await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_run).transpose()
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query("SELECT * FROM workflow_runs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_run).collect()
    }

    async fn stalled_runs(&self, idle_for: Duration) -> Result<Vec<WorkflowRun>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_for).unwrap_or_else(|_| chrono::Duration::zero());
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE status = 'running' AND updated_at < $1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_run).collect()
    }

    async fn request_cancel(&self, id: RunId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET cancel_requested = TRUE, updated_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "terminal" from "missing".
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM workflow_runs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_some() {
            Ok(false)
        } else {
            Err(LedgerError::RunNotFound(id))
        }
    }

    async fn record_resource(&self, entry: ResourceLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_ledger (kind, natural_key, status, run_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.kind.as_str())
        .bind(&entry.natural_key)
        .bind(entry.status.as_str())
        .bind(entry.run_id.as_uuid())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("uq_resource_ledger_live_key")
            {
                return LedgerError::DuplicateResource {
                    kind: entry.kind,
                    natural_key: entry.natural_key.clone(),
                };
            }
            LedgerError::Database(e)
        })?;

        Ok(())
    }

    async fn set_resource_status(
        &self,
        kind: ResourceKind,
        natural_key: &str,
        status: ResourceStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE resource_ledger
            SET status = $3
            WHERE id = (
                SELECT id FROM resource_ledger
                WHERE kind = $1 AND natural_key = $2 AND status <> 'rolled_back'
                ORDER BY id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(natural_key)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lookup(
        &self,
        kind: ResourceKind,
        natural_key: &str,
    ) -> Result<Option<ResourceLedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT kind, natural_key, status, run_id, created_at FROM resource_ledger
            WHERE kind = $1 AND natural_key = $2 AND status <> 'rolled_back'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn resources_for_run(&self, run_id: RunId) -> Result<Vec<ResourceLedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, natural_key, status, run_id, created_at FROM resource_ledger
            WHERE run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn list_resources(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceLedgerEntry>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r#"
                    SELECT kind, natural_key, status, run_id, created_at FROM resource_ledger
                    WHERE kind = $1
                    ORDER BY id ASC
                    "#,
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT kind, natural_key, status, run_id, created_at FROM resource_ledger
                    ORDER BY id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
