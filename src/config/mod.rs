mod schema;
mod watcher;

pub use schema::*;
pub use watcher::{ConfigWatcher, load_settings};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::{KeywordMatcher, TamperCategory};
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-style paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// Explicit config file from `--config`; otherwise `paths.config_file()`
    #[serde(skip)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub tamper: TamperConfig,

    #[serde(default)]
    pub keyword: KeywordConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// App identifiers that require a PIN
    #[serde(default)]
    pub protected_apps: Vec<String>,

    /// Idle time after which an unlocked app locks again
    #[serde(default = "default_session_timeout")]
    pub session_timeout: String,

    /// How often expired sessions are purged
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    #[serde(default = "default_true")]
    pub relock_on_screen_off: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TamperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window after a passed challenge during which settings are reachable
    #[serde(default = "default_bypass_duration")]
    pub bypass_duration: String,

    /// Categories treated as targeted when the target cannot be determined.
    /// A category left out lets unclassified accesses through.
    #[serde(default = "default_fail_closed")]
    pub fail_closed: Vec<TamperCategory>,

    #[serde(default = "default_true")]
    pub clear_recents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Matched case-insensitively as whole words
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,

    #[serde(default = "default_grace_period")]
    pub grace_period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}
fn default_session_timeout() -> String {
    "30s".to_string()
}
fn default_sweep_interval() -> String {
    "60s".to_string()
}
fn default_bypass_duration() -> String {
    "5m".to_string()
}
fn default_fail_closed() -> Vec<TamperCategory> {
    TamperCategory::ALL.to_vec()
}
fn default_countdown_secs() -> u32 {
    15
}
fn default_grace_period() -> String {
    "15s".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            protected_apps: Vec::new(),
            session_timeout: default_session_timeout(),
            sweep_interval: default_sweep_interval(),
            relock_on_screen_off: default_true(),
        }
    }
}

impl Default for TamperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bypass_duration: default_bypass_duration(),
            fail_closed: default_fail_closed(),
            clear_recents: default_true(),
        }
    }
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            keywords: Vec::new(),
            countdown_secs: default_countdown_secs(),
            grace_period: default_grace_period(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load from `file` if given (tilde-expanded), otherwise from the
    /// resolved config directory. The default location gets a commented
    /// template on first run; an explicit file must exist.
    pub fn load_with(file: Option<&str>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let file = file.map(|f| PathBuf::from(shellexpand::tilde(f).to_string()));
        Self::load_from(paths, file)
    }

    pub fn load_from(paths: Paths, file: Option<PathBuf>) -> Result<Self> {
        paths.ensure_dirs()?;

        let path = file.clone().unwrap_or_else(|| paths.config_file());
        if !path.exists() {
            if file.is_some() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let mut config = Self::read_file(&path)?;
        config.paths = paths;
        config.file = file;
        Ok(config)
    }

    /// Parse and validate a config file without touching directories.
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn file_path(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let session_timeout = parse_duration(&self.lock.session_timeout)
            .map_err(|e| anyhow::anyhow!("lock.session_timeout: {}", e))?;
        if session_timeout.is_zero() {
            anyhow::bail!("lock.session_timeout must be greater than zero");
        }

        let sweep_interval = parse_duration(&self.lock.sweep_interval)
            .map_err(|e| anyhow::anyhow!("lock.sweep_interval: {}", e))?;
        if sweep_interval.is_zero() {
            anyhow::bail!("lock.sweep_interval must be greater than zero");
        }

        parse_duration(&self.tamper.bypass_duration)
            .map_err(|e| anyhow::anyhow!("tamper.bypass_duration: {}", e))?;
        parse_duration(&self.keyword.grace_period)
            .map_err(|e| anyhow::anyhow!("keyword.grace_period: {}", e))?;

        if self.keyword.countdown_secs == 0 {
            anyhow::bail!("keyword.countdown_secs must be greater than zero");
        }
        KeywordMatcher::new(&self.keyword.keywords).context("keyword.keywords")?;

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["lock", "enabled"] => Ok(self.lock.enabled.to_string()),
            ["lock", "protected_apps"] => Ok(self.lock.protected_apps.join(",")),
            ["lock", "session_timeout"] => Ok(self.lock.session_timeout.clone()),
            ["lock", "sweep_interval"] => Ok(self.lock.sweep_interval.clone()),
            ["lock", "relock_on_screen_off"] => Ok(self.lock.relock_on_screen_off.to_string()),
            ["tamper", "enabled"] => Ok(self.tamper.enabled.to_string()),
            ["tamper", "bypass_duration"] => Ok(self.tamper.bypass_duration.clone()),
            ["tamper", "fail_closed"] => Ok(self
                .tamper
                .fail_closed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")),
            ["tamper", "clear_recents"] => Ok(self.tamper.clear_recents.to_string()),
            ["keyword", "enabled"] => Ok(self.keyword.enabled.to_string()),
            ["keyword", "keywords"] => Ok(self.keyword.keywords.join(",")),
            ["keyword", "countdown_secs"] => Ok(self.keyword.countdown_secs.to_string()),
            ["keyword", "grace_period"] => Ok(self.keyword.grace_period.clone()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    /// Set a dotted key. Lists take comma-separated values. The result is
    /// validated before it is kept.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let mut updated = self.clone();

        match parts.as_slice() {
            ["lock", "enabled"] => updated.lock.enabled = value.parse()?,
            ["lock", "protected_apps"] => updated.lock.protected_apps = parse_list(value),
            ["lock", "session_timeout"] => updated.lock.session_timeout = value.to_string(),
            ["lock", "sweep_interval"] => updated.lock.sweep_interval = value.to_string(),
            ["lock", "relock_on_screen_off"] => {
                updated.lock.relock_on_screen_off = value.parse()?
            }
            ["tamper", "enabled"] => updated.tamper.enabled = value.parse()?,
            ["tamper", "bypass_duration"] => updated.tamper.bypass_duration = value.to_string(),
            ["tamper", "fail_closed"] => {
                updated.tamper.fail_closed = parse_categories(value).map_err(anyhow::Error::msg)?
            }
            ["tamper", "clear_recents"] => updated.tamper.clear_recents = value.parse()?,
            ["keyword", "enabled"] => updated.keyword.enabled = value.parse()?,
            ["keyword", "keywords"] => updated.keyword.keywords = parse_list(value),
            ["keyword", "countdown_secs"] => updated.keyword.countdown_secs = value.parse()?,
            ["keyword", "grace_period"] => updated.keyword.grace_period = value.to_string(),
            ["audit", "enabled"] => updated.audit.enabled = value.parse()?,
            ["logging", "level"] => updated.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# PinGuard Configuration
# Auto-created on first run. Edit as needed; a running engine picks up
# every change except lock.sweep_interval without a restart.
#
# Durations: "<n>ms", "<n>s", "<n>m" or "<n>h".

[lock]
enabled = true
# protected_apps = ["com.example.mail", "com.example.bank"]
protected_apps = []
session_timeout = "30s"         # idle time before an unlocked app locks again
sweep_interval = "60s"
relock_on_screen_off = true

[tamper]
enabled = true
bypass_duration = "5m"          # settings stay reachable this long after a passed challenge
# Categories treated as targeted when the platform cannot tell which app
# a settings page is for. Removing one lets unclassified accesses through.
fail_closed = ["accessibility_settings", "device_admin_settings", "app_info", "overlay_permission"]
clear_recents = true

[keyword]
enabled = true
# keywords = ["casino", "poker"]
keywords = []
countdown_secs = 15
grace_period = "15s"

[audit]
enabled = true

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("pinguard.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();

        let defaults = Config::default();
        assert_eq!(config.lock.session_timeout, defaults.lock.session_timeout);
        assert_eq!(config.tamper.fail_closed, defaults.tamper.fail_closed);
        assert_eq!(config.tamper.fail_closed, TamperCategory::ALL.to_vec());
        assert_eq!(config.keyword.countdown_secs, 15);
        assert!(config.audit.enabled);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.lock.enabled);
        assert_eq!(config.tamper.bypass_duration, "5m");
        assert_eq!(config.keyword.grace_period, "15s");
    }

    #[test]
    fn first_load_writes_template() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(tmp.path());

        let config = Config::load_from(paths.clone(), None).unwrap();
        assert_eq!(
            fs::read_to_string(paths.config_file()).unwrap(),
            DEFAULT_CONFIG_TEMPLATE
        );
        assert!(config.lock.protected_apps.is_empty());
        assert!(paths.state_dir.is_dir());
    }

    #[test]
    fn explicit_file_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(Config::load_from(Paths::rooted(tmp.path()), Some(missing)).is_err());
    }

    #[test]
    fn explicit_file_is_read_and_saved_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[lock]
protected_apps = ["app.mail"]
session_timeout = "45s"

[tamper]
fail_closed = ["accessibility_settings"]
"#,
        );

        let mut config = Config::load_from(Paths::rooted(tmp.path()), Some(path.clone())).unwrap();
        assert_eq!(config.lock.protected_apps, vec!["app.mail"]);
        assert_eq!(
            config.tamper.fail_closed,
            vec![TamperCategory::AccessibilitySettings]
        );

        config.set_value("keyword.keywords", "casino, poker").unwrap();
        config.save().unwrap();

        let reread = Config::read_file(&path).unwrap();
        assert_eq!(reread.keyword.keywords, vec!["casino", "poker"]);
        assert_eq!(reread.lock.session_timeout, "45s");
    }

    #[test]
    fn validation_rejects_zero_and_malformed_values() {
        let tmp = tempfile::tempdir().unwrap();
        for bad in [
            "[lock]\nsession_timeout = \"0s\"",
            "[lock]\nsweep_interval = \"soon\"",
            "[tamper]\nbypass_duration = \"\"",
            "[keyword]\ncountdown_secs = 0",
        ] {
            let path = write_config(tmp.path(), bad);
            assert!(Config::read_file(&path).is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn get_and_set_dotted_keys() {
        let mut config = Config::default();
        config.set_value("lock.protected_apps", "a, b,,c").unwrap();
        assert_eq!(config.get_value("lock.protected_apps").unwrap(), "a,b,c");

        config
            .set_value("tamper.fail_closed", "app_info,device_admin_settings")
            .unwrap();
        assert_eq!(
            config.get_value("tamper.fail_closed").unwrap(),
            "app_info,device_admin_settings"
        );

        config.set_value("tamper.enabled", "false").unwrap();
        assert_eq!(config.get_value("tamper.enabled").unwrap(), "false");

        assert!(config.get_value("lock.nope").is_err());
        assert!(config.set_value("lock.enabled", "maybe").is_err());
    }

    #[test]
    fn rejected_set_leaves_config_unchanged() {
        let mut config = Config::default();
        assert!(config.set_value("lock.session_timeout", "0ms").is_err());
        assert_eq!(config.lock.session_timeout, "30s");
        assert!(config.set_value("tamper.fail_closed", "camera").is_err());
        assert_eq!(config.tamper.fail_closed, default_fail_closed());
    }
}
