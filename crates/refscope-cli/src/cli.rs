use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "refscope",
    about = "refscope: replay ref operations and trace what the ref store does",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Store configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Wrap the store in the tracing decorator
    #[arg(long, global = true, conflicts_with = "no_trace")]
    pub trace: bool,

    /// Never trace, whatever the config says
    #[arg(long, global = true)]
    pub no_trace: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replay a ref script against a fresh store
    Run(RunArgs),
    /// Show the effective store configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Script file, or `-` for standard input
    pub script: String,
    /// Report failing steps and continue instead of stopping
    #[arg(short = 'k', long)]
    pub keep_going: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    pub key: Option<String>,
}
