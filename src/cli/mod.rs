pub mod audit;
pub mod bypass;
pub mod config;
pub mod paths;
pub mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pinguard")]
#[command(author, version, about = "App-lock and anti-tamper protection engine")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines (on stderr)
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "PINGUARD_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the protection engine, speaking JSON lines on stdin/stdout
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Inspect or clear the persisted bypass window
    Bypass(bypass::BypassArgs),

    /// Protection audit log
    Audit(audit::AuditArgs),

    /// Show resolved directory paths
    Paths,
}
