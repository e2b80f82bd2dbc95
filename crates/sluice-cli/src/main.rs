//! Sluice CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;
mod telemetry;

use crate::commands::Commands;
use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about = "Sluice pipeline scheduler", long_about = None)]
struct Cli {
    /// Server config file (YAML); `SLUICE_*` variables override it
    #[arg(short, long, global = true, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    telemetry::init_tracing(&config.log_filter, config.log_json);

    match cli.command {
        Commands::Serve { bind, pipelines } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(dir) = pipelines {
                config.pipelines_dir = Some(dir);
            }
            handlers::serve(config).await?
        }
        Commands::Validate { paths } => handlers::validate(&paths)?,
        Commands::Schema => handlers::schema()?,
        Commands::Init { path } => handlers::init(&path)?,
    }

    Ok(())
}
