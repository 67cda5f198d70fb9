//! XDG-style path resolution.
//!
//! Each directory resolves through a three-level fallback:
//! 1. PinGuard env var (PINGUARD_CONFIG_DIR, PINGUARD_STATE_DIR, PINGUARD_RUNTIME_DIR)
//! 2. XDG env var via `etcetera`
//! 3. Platform default (~/.config, ~/.local/state, /tmp)
//!
//! Relative paths from env vars are ignored.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

use crate::engine::state::STATE_FILENAME;
use crate::security::AUDIT_FILENAME;

/// Resolved directories. All paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Persisted engine state and the audit log
    pub state_dir: PathBuf,

    /// Single-instance lock. None if no runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "PINGUARD_CONFIG_DIR", || {
            strategy.config_dir().join("pinguard")
        });

        let state_dir = env_or(&env_fn, "PINGUARD_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("pinguard")
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            state_dir,
            runtime_dir,
        })
    }

    /// Paths rooted in one directory. Used by tests and `--state-dir` style
    /// overrides.
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            runtime_dir: Some(root.join("run")),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Bypass timestamp and capability cache.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILENAME)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join(AUDIT_FILENAME)
    }

    /// Single-instance lock (in runtime_dir, falls back to state_dir)
    pub fn instance_lock(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("pinguard.lock")
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir_with_mode(&self.config_dir)?;
        create_dir_with_mode(&self.state_dir)?;
        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("pinguard"),
                state_dir: home.join(".local").join("state").join("pinguard"),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(shellexpand::tilde(&v).to_string()))
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("PINGUARD_RUNTIME_DIR") {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path);
        }
    }

    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join("pinguard"));
        }
    }

    // $TMPDIR/pinguard-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("pinguard-{}", uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("pinguard-{}", user))
        })
    }
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_end_in_app_dir() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_dir.ends_with("pinguard"), "{:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with("pinguard"), "{:?}", paths.state_dir);
        assert!(paths.runtime_dir.is_some());
    }

    #[test]
    fn env_vars_override_xdg() {
        let env = HashMap::from([
            ("PINGUARD_CONFIG_DIR", "/custom/config"),
            ("PINGUARD_STATE_DIR", "/custom/state"),
            ("PINGUARD_RUNTIME_DIR", "/custom/run"),
        ]);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.runtime_dir, Some(PathBuf::from("/custom/run")));
        assert_eq!(paths.instance_lock(), PathBuf::from("/custom/run/pinguard.lock"));
    }

    #[test]
    fn xdg_runtime_dir_gets_app_subdir() {
        let env = HashMap::from([("XDG_RUNTIME_DIR", "/run/user/1000")]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(
            paths.runtime_dir,
            Some(PathBuf::from("/run/user/1000/pinguard"))
        );
    }

    #[test]
    fn relative_and_empty_values_are_ignored() {
        let env = HashMap::from([
            ("PINGUARD_CONFIG_DIR", "relative/path"),
            ("PINGUARD_STATE_DIR", ""),
        ]);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
        assert!(paths.state_dir.ends_with("pinguard"));
    }

    #[test]
    fn file_accessors() {
        let paths = Paths::rooted(Path::new("/srv/pg"));
        assert_eq!(paths.config_file(), PathBuf::from("/srv/pg/config/config.toml"));
        assert!(paths.state_file().ends_with("state/pinguard.state.json"));
        assert!(paths.audit_log().ends_with("state/pinguard.audit.jsonl"));
        assert!(paths.instance_lock().ends_with("run/pinguard.lock"));
    }

    #[test]
    fn ensure_dirs_creates_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(tmp.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir());
        assert!(paths.state_dir.is_dir());
        assert!(paths.runtime_dir.unwrap().is_dir());
    }
}
