//! Append-only, hash-chained protection audit log.
//!
//! Stored at `<state_dir>/pinguard.audit.jsonl`. Each line is one JSON
//! object carrying the SHA-256 of the previous line, so deleting or
//! editing an entry breaks the chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `tamper_blocked`, `bypass_granted`, `countdown_expired`, ... |
//! | `subject` | Tamper category or app id the event is about |
//! | `prev_entry_sha256` | SHA-256 of the previous raw line |
//! | `source` | `engine`, `cli`, or `audit_system` |
//!
//! The first entry links to 64 zeros. A corrupt last line gets a
//! `chain_recovery` entry before the next append.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const AUDIT_FILENAME: &str = "pinguard.audit.jsonl";

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    #[serde(default)]
    pub subject: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A settings surface was blocked.
    TamperBlocked,
    /// High-friction challenge passed; bypass window opened.
    BypassGranted,
    /// Bypass window closed by an admin action or feature toggle.
    BypassCleared,
    /// Bypass window ran out.
    BypassExpired,
    /// Keyword countdown reached zero and the user was sent home.
    CountdownExpired,
    /// User took the one keyword deferral.
    GraceGranted,
    /// Tamper protection was switched off.
    ProtectionDisabled,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Append one entry, linking it to the last line of the log.
pub fn append_audit_entry(
    state_dir: &Path,
    action: AuditAction,
    subject: &str,
    source: &str,
    detail: Option<&str>,
) -> Result<()> {
    let path = audit_file_path(state_dir);

    let prev_hash = match last_line(&path)? {
        Some(line) if serde_json::from_str::<AuditEntry>(&line).is_ok() => {
            sha256_hex(line.as_bytes())
        }
        Some(line) => {
            let recovery = AuditEntry {
                ts: chrono::Utc::now().to_rfc3339(),
                action: AuditAction::ChainRecovery,
                subject: String::new(),
                prev_entry_sha256: sha256_hex(line.as_bytes()),
                source: "audit_system".to_string(),
                detail: Some(format!(
                    "Previous entry corrupted ({} bytes), new chain segment",
                    line.len()
                )),
            };
            let recovery_json =
                serde_json::to_string(&recovery).context("Failed to serialize recovery entry")?;
            append_line(&path, &recovery_json)?;
            sha256_hex(recovery_json.as_bytes())
        }
        None => GENESIS_HASH.to_string(),
    };

    let entry = AuditEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        action,
        subject: subject.to_string(),
        prev_entry_sha256: prev_hash,
        source: source.to_string(),
        detail: detail.map(str::to_string),
    };

    let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
    append_line(&path, &json)
}

fn last_line(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .rev()
        .find(|l| !l.is_empty())
        .map(str::to_string))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create audit log directory")?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// All parseable entries; corrupt lines are skipped.
pub fn read_audit_log(state_dir: &Path) -> Result<Vec<AuditEntry>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Indices of lines whose chain link is broken or that do not parse.
/// Empty means intact.
pub fn verify_audit_chain(state_dir: &Path) -> Result<Vec<usize>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Engine-side writer. Failures are logged and swallowed: a full disk must
/// never change a protection decision.
#[derive(Debug, Clone)]
pub struct AuditLog {
    state_dir: PathBuf,
}

impl AuditLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn record(&self, action: AuditAction, subject: &str, detail: Option<&str>) {
        if let Err(e) = append_audit_entry(&self.state_dir, action, subject, "engine", detail) {
            warn!("Failed to write audit entry {:?}: {:#}", action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_intact_after_appends() {
        let tmp = tempfile::tempdir().unwrap();
        for category in ["app_info", "overlay_permission", "device_admin_settings"] {
            append_audit_entry(tmp.path(), AuditAction::TamperBlocked, category, "test", None)
                .unwrap();
        }

        let entries = read_audit_log(tmp.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_entry_sha256, GENESIS_HASH);
        assert_eq!(entries[1].subject, "overlay_permission");
        assert!(verify_audit_chain(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn edited_entry_breaks_next_link() {
        let tmp = tempfile::tempdir().unwrap();
        for app in ["a", "b", "c"] {
            append_audit_entry(tmp.path(), AuditAction::CountdownExpired, app, "test", None)
                .unwrap();
        }

        let path = audit_file_path(tmp.path());
        let content = fs::read_to_string(&path).unwrap();
        let edited = content.replacen("\"subject\":\"b\"", "\"subject\":\"z\"", 1);
        fs::write(&path, edited).unwrap();

        let broken = verify_audit_chain(tmp.path()).unwrap();
        assert_eq!(broken, vec![2]);
    }

    #[test]
    fn corrupt_tail_gets_recovery_entry() {
        let tmp = tempfile::tempdir().unwrap();
        append_audit_entry(tmp.path(), AuditAction::BypassGranted, "", "cli", None).unwrap();

        let path = audit_file_path(tmp.path());
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "garbage").unwrap();
        drop(file);

        append_audit_entry(tmp.path(), AuditAction::BypassCleared, "", "cli", None).unwrap();

        let entries = read_audit_log(tmp.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].action, AuditAction::ChainRecovery);
        assert_eq!(entries[1].source, "audit_system");
        // The garbage line itself is reported, the links after it hold.
        assert_eq!(verify_audit_chain(tmp.path()).unwrap(), vec![1]);
    }

    #[test]
    fn missing_log_is_empty_and_intact() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_audit_log(tmp.path()).unwrap().is_empty());
        assert!(verify_audit_chain(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn detail_omitted_when_absent() {
        let entry = AuditEntry {
            ts: "2026-10-19T10:00:00Z".to_string(),
            action: AuditAction::GraceGranted,
            subject: "app.video".to_string(),
            prev_entry_sha256: GENESIS_HASH.to_string(),
            source: "engine".to_string(),
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"grace_granted\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn audit_log_swallows_write_errors() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the state directory should be makes every write fail.
        let blocker = tmp.path().join("blocked");
        fs::write(&blocker, "").unwrap();
        AuditLog::new(&blocker).record(AuditAction::TamperBlocked, "app_info", None);
        assert!(read_audit_log(tmp.path()).unwrap().is_empty());
    }
}
