//! `pinguard bypass`: offline view of the persisted bypass window.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::clock::{Clock, SystemClock};
use crate::concurrency::InstanceLock;
use crate::config::{Config, parse_duration};
use crate::engine::{BypassTracker, StateFile};
use crate::security::{AuditAction, append_audit_entry};

#[derive(Args)]
pub struct BypassArgs {
    #[command(subcommand)]
    pub command: BypassCommands,
}

#[derive(Subcommand)]
pub enum BypassCommands {
    /// Show whether the bypass window is open and for how long
    Status,

    /// Close the bypass window now
    Clear,
}

pub fn run(args: BypassArgs, config: &Config) -> Result<()> {
    match args.command {
        BypassCommands::Status => status(config),
        BypassCommands::Clear => clear(config),
    }
}

fn tracker(config: &Config) -> Result<BypassTracker> {
    let duration = parse_duration(&config.tamper.bypass_duration).map_err(anyhow::Error::msg)?;
    let state = StateFile::load(&config.paths.state_dir)?;
    Ok(BypassTracker::new(state, duration, config.tamper.enabled))
}

fn status(config: &Config) -> Result<()> {
    // Read-only: a running engine owns writes to the state file.
    let bypass = tracker(config)?;
    let remaining_ms = bypass.peek_remaining_ms(SystemClock.now_ms());

    if !bypass.protection_enabled() {
        println!("Tamper protection is disabled");
    } else if remaining_ms > 0 {
        println!(
            "Bypass window open: {}s remaining",
            remaining_ms.div_ceil(1000)
        );
    } else {
        println!("Bypass window closed");
    }
    Ok(())
}

fn clear(config: &Config) -> Result<()> {
    // A running engine keeps the window in memory and would not see this.
    let lock = InstanceLock::new(config.paths.instance_lock())?;
    if lock.try_acquire()?.is_none() {
        anyhow::bail!("The engine is running; stop it before clearing the bypass window");
    }

    let mut bypass = tracker(config)?;
    if bypass.clear() {
        if config.audit.enabled {
            append_audit_entry(
                &config.paths.state_dir,
                AuditAction::BypassCleared,
                "",
                "cli",
                None,
            )?;
        }
        println!("Bypass window cleared");
    } else {
        println!("No bypass window to clear");
    }
    Ok(())
}
