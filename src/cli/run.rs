use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::concurrency::InstanceLock;
use crate::config::{Config, ConfigWatcher};
use crate::engine::{
    Collaborators, EngineRuntime, EngineSettings, PackageMatchClassifier, ProtectionEngine,
    StateFile,
};
use crate::security::AuditLog;
use crate::wire::{Dispatcher, Flow, HostCapabilities, HostContent, StdioSurface, write_outbound};

#[derive(Args)]
pub struct RunArgs {
    /// Package name of the protected app itself, used to tell whether a
    /// settings page targets it
    #[arg(long, env = "PINGUARD_PACKAGE", default_value = "org.pinguard.app")]
    pub package: String,

    /// Do not reload the config file when it changes
    #[arg(long)]
    pub no_watch: bool,
}

pub async fn run(args: RunArgs, config: Config) -> Result<()> {
    let paths = &config.paths;

    let lock = InstanceLock::new(paths.instance_lock())?;
    let Some(_guard) = lock.try_acquire()? else {
        anyhow::bail!(
            "Another engine is already running (lock {}, pid {})",
            lock.path().display(),
            lock.holder_pid()
                .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
        );
    };

    let settings = EngineSettings::from_config(&config)?;
    let state = StateFile::load(&paths.state_dir).context("Failed to load engine state")?;

    let runtime = EngineRuntime::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let capabilities = HostCapabilities::default();
    let content = HostContent::default();

    let mut engine = ProtectionEngine::new(
        settings,
        state,
        Collaborators {
            clock: Arc::new(SystemClock),
            surface: Box::new(StdioSurface::new(out_tx.clone())),
            capabilities: Box::new(capabilities.clone()),
            content: Box::new(content.clone()),
            classifier: Box::new(PackageMatchClassifier::new(&args.package)),
            scheduler: Box::new(runtime.scheduler()),
        },
    )?;
    if config.audit.enabled {
        engine = engine.with_audit(AuditLog::new(&paths.state_dir));
    }

    let handle = runtime.handle();
    let engine_task = runtime.spawn(engine);
    let writer = tokio::spawn(write_outbound(out_rx, tokio::io::stdout()));

    let _watcher = if args.no_watch {
        None
    } else {
        match ConfigWatcher::spawn(config.file_path(), handle.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config watcher unavailable: {:#}", e);
                None
            }
        }
    };

    info!("PinGuard engine started (package {})", args.package);

    let dispatcher = Dispatcher::new(handle.clone(), capabilities, content, out_tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("Input closed");
                    break;
                };
                if dispatcher.handle_line(&line).await? == Flow::Stop {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Already stopped when the host sent `shutdown`.
    let _ = handle.shutdown().await;
    drop(dispatcher);
    drop(engine_task.await.context("Engine task failed")?);
    writer.await.context("Output task failed")??;

    info!("PinGuard engine stopped");
    Ok(())
}
