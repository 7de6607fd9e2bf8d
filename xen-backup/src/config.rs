//! Configuration management.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::registry::REGISTRY_FILE;
use crate::transfer::{DEFAULT_POLL_INTERVAL, DEFAULT_PROGRESS_CEILING};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub xenserver: XenServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XenServerConfig {
    /// Pool master address or URL
    pub host: String,

    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Accept self-signed certificates (the pool default)
    #[serde(default = "default_insecure_tls")]
    pub insecure_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per backup set
    pub dir: PathBuf,

    /// Registry document; defaults to `{dir}/backup_set.json`
    #[serde(default)]
    pub registry_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Task progress treated as done while the task is still pending
    #[serde(default = "default_progress_ceiling")]
    pub progress_ceiling: f64,

    /// Default export endpoint (an address of the VM's host)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Data-plane port on the host addresses, when not the scheme default
    #[serde(default)]
    pub export_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Appended to the captured VM name
    #[serde(default = "default_name_suffix")]
    pub name_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_insecure_tls() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_progress_ceiling() -> f64 {
    DEFAULT_PROGRESS_CEILING
}

fn default_name_suffix() -> String {
    "-restored".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for XenServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: "root".to_string(),
            password: String::new(),
            insecure_tls: default_insecure_tls(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/xen-backup"),
            registry_file: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            progress_ceiling: default_progress_ceiling(),
            endpoint: None,
            export_port: None,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            name_suffix: default_name_suffix(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `XEN_BACKUP_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("XEN_BACKUP_HOST") {
            self.xenserver.host = host;
        }
        if let Some(username) = lookup("XEN_BACKUP_USERNAME") {
            self.xenserver.username = username;
        }
        if let Some(password) = lookup("XEN_BACKUP_PASSWORD") {
            self.xenserver.password = password;
        }
        if let Some(dir) = lookup("XEN_BACKUP_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.xenserver.host.trim().is_empty() {
            return Err(BackupError::Config("xenserver.host is not set".to_string()));
        }
        if self.xenserver.username.trim().is_empty() {
            return Err(BackupError::Config("xenserver.username is not set".to_string()));
        }
        if self.storage.dir.as_os_str().is_empty() {
            return Err(BackupError::Config("storage.dir is not set".to_string()));
        }
        if self.transfer.poll_interval_secs == 0 {
            return Err(BackupError::Config(
                "transfer.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if !(self.transfer.progress_ceiling > 0.0 && self.transfer.progress_ceiling <= 1.0) {
            return Err(BackupError::Config(format!(
                "transfer.progress_ceiling must be in (0, 1], got {}",
                self.transfer.progress_ceiling
            )));
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage
            .registry_file
            .clone()
            .unwrap_or_else(|| self.storage.dir.join(REGISTRY_FILE))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.transfer.poll_interval_secs)
    }
}
