//! PostgreSQL implementation of PipelineStore.

use super::db_err;
use async_trait::async_trait;
use sluice_core::Result;
use sluice_core::ids::PipelineId;
use sluice_core::pipeline::{Pipeline, PipelineDefinition};
use sluice_core::ports::PipelineStore;
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of PipelineStore.
#[derive(Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pipeline(r: &sqlx::postgres::PgRow) -> Result<Pipeline> {
        let definition: PipelineDefinition = serde_json::from_value(r.get("definition"))?;
        Ok(Pipeline {
            definition,
            version: r.get::<i32, _>("version") as u32,
            registered_at: r.get("registered_at"),
            updated_at: r.get("updated_at"),
        })
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn save(&self, pipeline: &Pipeline) -> Result<()> {
        let definition_json = serde_json::to_value(&pipeline.definition)?;

        sqlx::query(
            r#"INSERT INTO pipelines (id, version, definition, registered_at, updated_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (id) DO UPDATE
               SET version = EXCLUDED.version, definition = EXCLUDED.definition, updated_at = EXCLUDED.updated_at"#,
        )
        .bind(pipeline.id().as_str())
        .bind(pipeline.version as i32)
        .bind(&definition_json)
        .bind(pipeline.registered_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        let row = sqlx::query(
            "SELECT id, version, definition, registered_at, updated_at FROM pipelines WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query(
            "SELECT id, version, definition, registered_at, updated_at FROM pipelines ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }
}
