use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::time::Duration;

use pinguard::cli::{self, Cli, Commands};
use pinguard::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(cli));

    // Stdin reads cannot be cancelled; do not wait on them forever.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn async_main(cli: Cli) -> Result<()> {
    // Config errors surface from the commands that need a config.
    let config = Config::load_with(cli.config.as_deref());
    let config_level = config
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    // RUST_LOG wins, then --verbose, then [logging] level. Logs go to
    // stderr: stdout carries the engine protocol.
    let log_level = if cli.verbose { "debug".to_string() } else { config_level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Run(args) => cli::run::run(args, config?).await,
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()),
        Commands::Bypass(args) => cli::bypass::run(args, &config?),
        Commands::Audit(args) => cli::audit::run(args, &config?),
        Commands::Paths => cli::paths::run(),
    }
}
