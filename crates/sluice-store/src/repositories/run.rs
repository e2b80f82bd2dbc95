//! PostgreSQL implementation of RunStore.
//!
//! A run and its task runs are written in one transaction and read back in
//! one snapshot, so readers never see a run half-updated.

use super::db_err;
use async_trait::async_trait;
use sluice_core::Result;
use sluice_core::ids::{PipelineId, RunId};
use sluice_core::ports::RunStore;
use sluice_core::run::{Run, RunFilter, RunStatus, RunTrigger, TaskRun, TaskStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;

const RUN_COLUMNS: &str = "id, pipeline_id, pipeline_version, status, trigger, params, reason, created_at, started_at, completed_at, duration_ms";
const TASK_COLUMNS: &str = "run_id, name, depends_on, status, attempts, output, error, logs, started_at, completed_at, duration_ms";

/// PostgreSQL implementation of RunStore.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn snapshot(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(tx)
    }

    fn row_to_run(r: &PgRow, tasks: Vec<TaskRun>) -> Result<Run> {
        let trigger: RunTrigger = serde_json::from_value(r.get("trigger"))?;
        let params = serde_json::from_value(r.get("params"))?;
        let status: RunStatus = r.get::<String, _>("status").parse()?;

        Ok(Run {
            id: RunId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            pipeline_id: PipelineId::new(r.get::<String, _>("pipeline_id")),
            pipeline_version: r.get::<i32, _>("pipeline_version") as u32,
            trigger,
            status,
            params,
            tasks,
            created_at: r.get("created_at"),
            started_at: r.get("started_at"),
            completed_at: r.get("completed_at"),
            duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
            reason: r.get("reason"),
        })
    }

    fn row_to_task(r: &PgRow) -> Result<TaskRun> {
        let status: TaskStatus = r.get::<String, _>("status").parse()?;
        Ok(TaskRun {
            name: r.get("name"),
            depends_on: serde_json::from_value(r.get("depends_on"))?,
            status,
            attempts: r.get::<i32, _>("attempts") as u32,
            output: r.get("output"),
            error: r.get("error"),
            logs: serde_json::from_value(r.get("logs"))?,
            started_at: r.get("started_at"),
            completed_at: r.get("completed_at"),
            duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
        })
    }

    /// Load task runs for a set of runs, grouped by run id in task order.
    async fn load_tasks(
        tx: &mut Transaction<'static, Postgres>,
        ids: Vec<uuid::Uuid>,
    ) -> Result<HashMap<uuid::Uuid, Vec<TaskRun>>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_runs WHERE run_id = ANY($1) ORDER BY run_id, position",
            TASK_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;

        let mut grouped: HashMap<uuid::Uuid, Vec<TaskRun>> = HashMap::new();
        for row in &rows {
            grouped
                .entry(row.get("run_id"))
                .or_default()
                .push(Self::row_to_task(row)?);
        }
        Ok(grouped)
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn upsert(&self, run: &Run) -> Result<()> {
        let trigger_json = serde_json::to_value(&run.trigger)?;
        let params_json = serde_json::to_value(&run.params)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"INSERT INTO runs (id, pipeline_id, pipeline_version, status, trigger, params, reason, created_at, started_at, completed_at, duration_ms, sort_key)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (id) DO UPDATE
               SET status = EXCLUDED.status, reason = EXCLUDED.reason,
                   started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at,
                   duration_ms = EXCLUDED.duration_ms, sort_key = EXCLUDED.sort_key"#,
        )
        .bind(run.id.as_uuid())
        .bind(run.pipeline_id.as_str())
        .bind(run.pipeline_version as i32)
        .bind(run.status.as_str())
        .bind(&trigger_json)
        .bind(&params_json)
        .bind(&run.reason)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(run.sort_key())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for (position, task) in run.tasks.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO task_runs (run_id, position, name, depends_on, status, attempts, output, error, logs, started_at, completed_at, duration_ms)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (run_id, name) DO UPDATE
                   SET status = EXCLUDED.status, attempts = EXCLUDED.attempts, output = EXCLUDED.output,
                       error = EXCLUDED.error, logs = EXCLUDED.logs, started_at = EXCLUDED.started_at,
                       completed_at = EXCLUDED.completed_at, duration_ms = EXCLUDED.duration_ms"#,
            )
            .bind(run.id.as_uuid())
            .bind(position as i32)
            .bind(&task.name)
            .bind(serde_json::to_value(&task.depends_on)?)
            .bind(task.status.as_str())
            .bind(task.attempts as i32)
            .bind(&task.output)
            .bind(&task.error)
            .bind(serde_json::to_value(&task.logs)?)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.duration_ms.map(|d| d as i64))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        let mut tx = self.snapshot().await?;

        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = $1", RUN_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut tasks = Self::load_tasks(&mut tx, vec![*id.as_uuid()]).await?;
        tx.commit().await.map_err(db_err)?;

        let run = Self::row_to_run(&row, tasks.remove(id.as_uuid()).unwrap_or_default())?;
        Ok(Some(run))
    }

    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM runs WHERE TRUE", RUN_COLUMNS));

        if let Some(pipeline_id) = &filter.pipeline_id {
            qb.push(" AND pipeline_id = ")
                .push_bind(pipeline_id.as_str().to_string());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND sort_key >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND sort_key <= ").push_bind(until);
        }
        qb.push(" ORDER BY sort_key DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        qb.push(" OFFSET ").push_bind(filter.offset as i64);

        let mut tx = self.snapshot().await?;
        let rows = qb.build().fetch_all(&mut *tx).await.map_err(db_err)?;
        let ids = rows.iter().map(|r| r.get::<uuid::Uuid, _>("id")).collect();
        let mut tasks = Self::load_tasks(&mut tx, ids).await?;
        tx.commit().await.map_err(db_err)?;

        rows.iter()
            .map(|r| {
                let id: uuid::Uuid = r.get("id");
                Self::row_to_run(r, tasks.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
