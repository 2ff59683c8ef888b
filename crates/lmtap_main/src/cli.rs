use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Transparent LLM reverse proxy with a branched conversation ledger")]
pub struct Cli {
    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,
}
