//! Durable stores for Sluice.
//!
//! The in-memory stores back tests and single-process deployments; the
//! PostgreSQL repositories back everything else.

pub mod memory;
pub mod repositories;

pub use memory::{InMemoryPipelineStore, InMemoryRunStore, InMemoryTriggerStore};
pub use repositories::*;

use sluice_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn run_store(&self) -> PgRunStore {
        PgRunStore::new(self.pool.clone())
    }

    pub fn pipeline_store(&self) -> PgPipelineStore {
        PgPipelineStore::new(self.pool.clone())
    }

    pub fn trigger_store(&self) -> PgTriggerStore {
        PgTriggerStore::new(self.pool.clone())
    }
}
