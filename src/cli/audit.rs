use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::security::{audit_file_path, read_audit_log, verify_audit_chain};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print recent audit entries
    Show {
        /// Number of most recent entries to show (0 = all)
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check the hash chain for edits or deletions
    Verify,
}

pub fn run(args: AuditArgs, config: &Config) -> Result<()> {
    match args.command {
        AuditCommands::Show { limit, json } => show(config, limit, json),
        AuditCommands::Verify => verify(config),
    }
}

fn show(config: &Config, limit: usize, json: bool) -> Result<()> {
    let entries = read_audit_log(&config.paths.state_dir)?;
    if entries.is_empty() {
        println!("No audit entries");
        return Ok(());
    }

    let skip = if limit == 0 {
        0
    } else {
        entries.len().saturating_sub(limit)
    };

    for entry in &entries[skip..] {
        if json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        let action = serde_json::to_value(entry.action)?;
        let action = action.as_str().unwrap_or_default();
        let subject = if entry.subject.is_empty() {
            "-"
        } else {
            entry.subject.as_str()
        };
        match entry.detail {
            Some(ref detail) => println!(
                "{}  {:<20} {:<24} [{}] {}",
                entry.ts, action, subject, entry.source, detail
            ),
            None => println!(
                "{}  {:<20} {:<24} [{}]",
                entry.ts, action, subject, entry.source
            ),
        }
    }
    Ok(())
}

fn verify(config: &Config) -> Result<()> {
    let path = audit_file_path(&config.paths.state_dir);
    let broken = verify_audit_chain(&config.paths.state_dir)?;

    if broken.is_empty() {
        println!("Audit chain intact: {}", path.display());
        return Ok(());
    }

    for line in &broken {
        println!("Broken link at entry {}", line);
    }
    anyhow::bail!(
        "Audit chain at {} has {} broken link(s)",
        path.display(),
        broken.len()
    )
}
