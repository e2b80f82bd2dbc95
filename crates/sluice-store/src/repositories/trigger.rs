//! PostgreSQL implementation of TriggerStore.

use super::db_err;
use async_trait::async_trait;
use sluice_core::Result;
use sluice_core::ids::{PipelineId, TriggerId};
use sluice_core::pipeline::TriggerState;
use sluice_core::ports::TriggerStore;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn load_all(&self) -> Result<Vec<TriggerState>> {
        let rows = sqlx::query(
            "SELECT trigger_id, pipeline_id, next_fire_at, last_fired_at FROM trigger_states",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| TriggerState {
                trigger_id: TriggerId::new(r.get::<String, _>("trigger_id")),
                pipeline_id: PipelineId::new(r.get::<String, _>("pipeline_id")),
                next_fire_at: r.get("next_fire_at"),
                last_fired_at: r.get("last_fired_at"),
            })
            .collect())
    }

    async fn save(&self, state: &TriggerState) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO trigger_states (trigger_id, pipeline_id, next_fire_at, last_fired_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (trigger_id) DO UPDATE
               SET next_fire_at = EXCLUDED.next_fire_at, last_fired_at = EXCLUDED.last_fired_at"#,
        )
        .bind(state.trigger_id.as_str())
        .bind(state.pipeline_id.as_str())
        .bind(state.next_fire_at)
        .bind(state.last_fired_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn delete(&self, trigger_id: &TriggerId) -> Result<()> {
        sqlx::query("DELETE FROM trigger_states WHERE trigger_id = $1")
            .bind(trigger_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
