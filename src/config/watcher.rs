//! Live reload of the config file into a running engine.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::Config;
use crate::engine::{EngineHandle, EngineSettings};

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConfigWatcher {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Watch `path` and post reloaded settings to `handle`. The watcher
    /// thread exits once the engine stops.
    pub fn spawn(path: PathBuf, handle: EngineHandle) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let target = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if is_config_change(&event, &target) => {
                    if let Err(e) = tx.send(()) {
                        warn!("Failed to forward config event: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Config watch error: {:?}", e),
            }
        })?;

        // Editors often replace the file, so watch its directory.
        let dir = path
            .parent()
            .context("Config file has no parent directory")?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching config file: {}", path.display());

        let reload_path = path.clone();
        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                // Let a burst of writes settle.
                let mut last_event = Instant::now();
                while last_event.elapsed() < DEBOUNCE {
                    match rx.recv_timeout(DEBOUNCE - last_event.elapsed()) {
                        Ok(()) => last_event = Instant::now(),
                        Err(mpsc::RecvTimeoutError::Timeout) => break,
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }

                let settings = match load_settings(&reload_path) {
                    Ok(settings) => settings,
                    Err(e) => {
                        warn!("Ignoring config change: {:#}", e);
                        continue;
                    }
                };

                if handle.reload(settings).is_err() {
                    debug!("Engine stopped, config watcher exiting");
                    return;
                }
                info!("Config reloaded from {}", reload_path.display());
            }
        });

        Ok(Self { watcher, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_config_change(event: &Event, target: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == target.file_name())
}

/// Read, validate and resolve the config file into engine settings.
pub fn load_settings(path: &Path) -> Result<EngineSettings> {
    let config = Config::read_file(path)?;
    EngineSettings::from_config(&config)
}
