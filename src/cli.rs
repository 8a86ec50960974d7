use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "wait0", about = "wait0 caching reverse proxy")]
pub struct Cli {
    /// Path to the wait0.yaml configuration file.
    #[arg(long, env = "WAIT0_CONFIG", default_value = "./wait0.yaml")]
    pub config: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    pub log: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
