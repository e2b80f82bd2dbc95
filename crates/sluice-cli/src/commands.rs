//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler and its HTTP API
    Serve {
        /// Address to listen on, overriding the config file
        #[arg(long)]
        bind: Option<String>,

        /// Directory of pipeline definitions to register at startup
        #[arg(long)]
        pipelines: Option<PathBuf>,
    },

    /// Validate pipeline definition files
    Validate {
        /// Pipeline files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the JSON Schema for pipeline definitions
    Schema,

    /// Write an example pipeline definition
    Init {
        /// Where to write the pipeline
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,
    },
}
