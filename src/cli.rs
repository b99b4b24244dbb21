use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "provd")]
#[command(version = "0.1.0")]
#[command(about = "Storage deal provider daemon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, global = true, default_value = "config", env = "PROVD_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the provider and serve the HTTP API
    Run,
    /// Print the resolved configuration
    Config,
}
