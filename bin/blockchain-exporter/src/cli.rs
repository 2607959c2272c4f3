use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, author, about, long_about = None)]
pub struct Args {
    /// Path to the blockchains TOML file; overrides
    /// BLOCKCHAIN_EXPORTER_CONFIG_PATH.
    #[arg(long)]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved settings and the parsed chain table, then
    /// exit.
    PrintConfig,

    /// Validate the configuration file and exit.
    ValidateConfig,
}
