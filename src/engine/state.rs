//! Engine state that survives process restarts.
//!
//! Only two things are persisted: the bypass window timestamp and the
//! last known activation state of each guarded capability. Stored at
//! `<state_dir>/pinguard.state.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::events::Capability;

pub const STATE_FILENAME: &str = "pinguard.state.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Epoch millis of the last successful high-friction challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_challenge_completion_ms: Option<u64>,

    /// Last authoritative activation state per capability.
    #[serde(default)]
    pub capability_cache: BTreeMap<Capability, bool>,
}

/// Owner of [`PersistedState`]. Every mutation is written through.
#[derive(Debug)]
pub struct StateFile {
    path: Option<PathBuf>,
    state: PersistedState,
}

impl StateFile {
    /// Load from `state_dir`. A missing file yields defaults; a corrupt one
    /// is logged and replaced by defaults.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(STATE_FILENAME);

        let state = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Engine state at {} is corrupt ({}), starting fresh", path.display(), e);
                    PersistedState::default()
                }
            }
        } else {
            PersistedState::default()
        };

        debug!("Loaded engine state from {:?}", path);
        Ok(Self {
            path: Some(path),
            state,
        })
    }

    /// Non-persistent state, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: PersistedState::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    /// Apply a mutation and write it through. A failed write leaves the
    /// in-memory state updated and is logged; the engine keeps running.
    pub fn update<F>(&mut self, f: F)
    where
        F: FnOnce(&mut PersistedState),
    {
        f(&mut self.state);
        if let Err(e) = self.save() {
            warn!("Failed to persist engine state: {:#}", e);
        }
    }

    /// Atomic write (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.state)?;
        let tmp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));

        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
