//! Store implementations for PostgreSQL.

mod pipeline;
mod run;
mod trigger;

pub use pipeline::PgPipelineStore;
pub use run::PgRunStore;
pub use trigger::PgTriggerStore;

fn db_err(e: sqlx::Error) -> sluice_core::Error {
    sluice_core::Error::Persistence(e.to_string())
}
