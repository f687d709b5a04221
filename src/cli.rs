use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "pictee", about = "Resizing image proxy with a streaming disk cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./pictee.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on; overrides the configuration file and the PORT variable.
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
