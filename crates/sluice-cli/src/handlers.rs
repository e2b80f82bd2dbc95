//! Command handlers.

use crate::config::{self, ServerConfig};
use anyhow::Context;
use console::style;
use sluice_api::{AppState, build_app};
use sluice_bus::InMemoryEventBus;
use sluice_core::clock::SystemClock;
use sluice_core::pipeline::PipelineDefinition;
use sluice_runner::HandlerRegistry;
use sluice_scheduler::{Scheduler, Stores};
use sluice_store::{Database, InMemoryPipelineStore, InMemoryRunStore, InMemoryTriggerStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

const PIPELINE_TEMPLATE: &str = r#"id: my-pipeline
name: My pipeline

params:
  target: staging

tasks:
  - name: extract
    run:
      kind: shell
      command: echo "extracting for $TARGET"
      env:
        TARGET: staging
    retry:
      max_attempts: 3
      delay_ms: 1000

  - name: transform
    depends_on: [extract]
    run:
      kind: sleep
      millis: 500

  - name: load
    depends_on: [transform]
    timeout_secs: 60
    run:
      kind: noop

triggers:
  - name: hourly
    schedule:
      type: cron
      expression: "0 * * * *"
  - name: on-demand
    schedule:
      type: manual

overlap:
  mode: reject
"#;

/// Run the scheduler and HTTP API until interrupted.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let stores = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("connecting to database")?;
            db.migrate().await.context("running migrations")?;
            info!("Using PostgreSQL stores");
            Stores {
                pipelines: Arc::new(db.pipeline_store()),
                runs: Arc::new(db.run_store()),
                triggers: Arc::new(db.trigger_store()),
            }
        }
        None => {
            warn!("No database_url configured, state will not survive a restart");
            Stores {
                pipelines: Arc::new(InMemoryPipelineStore::new()),
                runs: Arc::new(InMemoryRunStore::new()),
                triggers: Arc::new(InMemoryTriggerStore::new()),
            }
        }
    };

    let bus = Arc::new(InMemoryEventBus::with_config(config.bus_config()));
    let scheduler = Arc::new(Scheduler::new(
        stores,
        bus.clone(),
        HandlerRegistry::with_builtins(),
        Arc::new(SystemClock),
        config.scheduler_config(),
    ));

    scheduler.load().await.context("loading stored state")?;
    if let Some(dir) = &config.pipelines_dir {
        register_dir(&scheduler, dir).await?;
    }
    scheduler.start().await?;

    let app = build_app(AppState::new(scheduler.clone()).with_bus(bus));
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    Ok(())
}

/// Register every definition file in `dir`.
///
/// Stored state must already be loaded, otherwise a file would overwrite the
/// stored pipeline as version 1.
async fn register_dir(scheduler: &Scheduler, dir: &Path) -> anyhow::Result<usize> {
    let files = config::pipeline_files(dir)?;
    for path in &files {
        let definition = config::load_pipeline(path)?;
        let pipeline = scheduler
            .register_pipeline(definition)
            .await
            .with_context(|| format!("registering {}", path.display()))?;
        info!(
            pipeline_id = %pipeline.definition.id,
            version = pipeline.version,
            "Registered pipeline"
        );
    }
    Ok(files.len())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
}

/// Validate pipeline definition files without registering them.
pub fn validate(paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(config::pipeline_files(path)?);
        } else {
            files.push(path.clone());
        }
    }

    let mut invalid = 0;
    for path in &files {
        match check(path) {
            Ok(definition) => {
                println!(
                    "{} {} ({}): {} tasks, {} triggers",
                    style("✓").green(),
                    style(definition.display_name()).bold(),
                    path.display(),
                    definition.tasks.len(),
                    definition.triggers.len()
                );
            }
            Err(e) => {
                invalid += 1;
                println!("{} {}: {:#}", style("✗").red(), path.display(), e);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} definitions are invalid", files.len());
    }
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let definition = config::load_pipeline(path)?;
    Scheduler::validate_pipeline(&definition)?;
    Ok(definition)
}

/// Print the JSON schema for pipeline definitions.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Write a starter pipeline definition.
pub fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, PIPELINE_TEMPLATE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}
