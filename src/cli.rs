use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "cachebay", about = "Forward HTTP caching proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./cachebay.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override the log format from the configuration file.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
