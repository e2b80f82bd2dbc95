//! Server configuration.
//!
//! Values come from an optional YAML file, overlaid by `SLUICE_*`
//! environment variables (`SLUICE_BIND_ADDR`, `SLUICE_DATABASE_URL`, ...).

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use sluice_bus::BusConfig;
use sluice_core::pipeline::PipelineDefinition;
use sluice_scheduler::{ExecutorConfig, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Pipeline definitions registered at startup.
    #[serde(default)]
    pub pipelines_dir: Option<PathBuf>,
    /// PostgreSQL URL; in-memory stores are used when unset.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_cancel_grace_period_ms")]
    pub cancel_grace_period_ms: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_max_concurrent_tasks() -> usize {
    8
}
fn default_cancel_grace_period_ms() -> u64 {
    5000
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            pipelines_dir: None,
            database_url: None,
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            cancel_grace_period_ms: default_cancel_grace_period_ms(),
            subscriber_buffer: default_subscriber_buffer(),
            log_filter: default_log_filter(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Load from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder
            .add_source(Environment::with_prefix("SLUICE").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("invalid server configuration")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            executor: ExecutorConfig {
                max_concurrent_tasks: self.max_concurrent_tasks.max(1),
                cancel_grace_period: Duration::from_millis(self.cancel_grace_period_ms),
            },
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(10)),
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig::default().with_subscriber_buffer(self.subscriber_buffer)
    }
}

/// Parse one pipeline definition file.
pub fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Every `.yaml`/`.yml` file in `dir`, sorted by path.
pub fn pipeline_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
