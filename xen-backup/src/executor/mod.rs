//! Backup executor - orchestrates backups, restores and set deletion.
//!
//! Every operation works on one VM at a time and one disk at a time. Remote
//! objects and local directories created along the way go into a
//! [`SideEffectLedger`]; when an operation fails the ledger is logged so an
//! operator can clean up by hand. Nothing is rolled back automatically.

pub mod backup;
pub mod delete;
pub mod restore;

pub use backup::{BackupReport, DiskTransfer};
pub use delete::{delete_backup_set, DeleteReport, ALL_SETS};
pub use restore::{new_vm_spec, RestoreReport};

use crate::config::Config;
use crate::registry::{BackupSetRegistry, REGISTRY_FILE};
use crate::transfer::TransferEngine;
use crate::utils::errors::{BackupError, Result};
use crate::xapi::{normalize_host, OpaqueRef, XenApi};
use reqwest::Url;
use std::fmt;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

/// Something an operation created that outlives a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Snapshot { name: String, reference: OpaqueRef },
    Vm(OpaqueRef),
    Vdi(OpaqueRef),
    Vbd(OpaqueRef),
    Vif(OpaqueRef),
    LocalDir(PathBuf),
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideEffect::Snapshot { name, reference } => write!(f, "snapshot {} ({})", name, reference),
            SideEffect::Vm(r) => write!(f, "VM {}", r),
            SideEffect::Vdi(r) => write!(f, "VDI {}", r),
            SideEffect::Vbd(r) => write!(f, "VBD {}", r),
            SideEffect::Vif(r) => write!(f, "VIF {}", r),
            SideEffect::LocalDir(path) => write!(f, "directory {}", path.display()),
        }
    }
}

/// Side effects of one operation, in creation order.
#[derive(Debug, Default)]
pub struct SideEffectLedger {
    entries: Vec<SideEffect>,
}

impl SideEffectLedger {
    pub fn record(&mut self, effect: SideEffect) {
        self.entries.push(effect);
    }

    /// Drop an entry that was cleaned up or became part of a committed result.
    pub fn forget(&mut self, effect: &SideEffect) {
        self.entries.retain(|e| e != effect);
    }

    /// Log what a failed operation left on the pool and on disk, newest first.
    pub fn report_left_behind(&self, operation: &str) {
        if self.entries.is_empty() {
            return;
        }
        error!(
            "{} failed and left {} object(s) behind; clean up manually:",
            operation,
            self.entries.len()
        );
        for effect in self.entries.iter().rev() {
            warn!("  left behind: {}", effect);
        }
    }
}

/// Runs backup, restore and delete operations against one pool and one
/// storage root.
pub struct Executor {
    api: Arc<dyn XenApi>,
    transfer: TransferEngine,
    storage_dir: PathBuf,
    registry_path: PathBuf,
    /// Data-plane used for imports unless the caller names another one
    master_url: String,
    export_port: Option<u16>,
    restore_name_suffix: String,
}

impl Executor {
    pub fn new(
        api: Arc<dyn XenApi>,
        transfer: TransferEngine,
        storage_dir: impl Into<PathBuf>,
        master_url: impl Into<String>,
    ) -> Self {
        let storage_dir = storage_dir.into();
        Self {
            api,
            transfer,
            registry_path: storage_dir.join(REGISTRY_FILE),
            storage_dir,
            master_url: master_url.into(),
            export_port: None,
            restore_name_suffix: "-restored".to_string(),
        }
    }

    pub fn from_config(api: Arc<dyn XenApi>, config: &Config) -> Result<Self> {
        let transfer = TransferEngine::new(config.xenserver.insecure_tls)?
            .with_polling(config.poll_interval(), config.transfer.progress_ceiling);

        Ok(Self::new(
            api,
            transfer,
            config.storage.dir.clone(),
            normalize_host(&config.xenserver.host, "https"),
        )
        .with_registry_path(config.registry_path())
        .with_export_port(config.transfer.export_port)
        .with_restore_name_suffix(config.restore.name_suffix.clone()))
    }

    pub fn with_export_port(mut self, port: Option<u16>) -> Self {
        self.export_port = port;
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    pub fn with_restore_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.restore_name_suffix = suffix.into();
        self
    }

    pub fn api(&self) -> &dyn XenApi {
        self.api.as_ref()
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn open_registry(&self) -> Result<BackupSetRegistry> {
        BackupSetRegistry::open(&self.registry_path)
    }

    /// Data-plane URL for a host address. Plain HTTP, as the hosts serve it.
    /// A port in `address` wins over the configured export port.
    pub fn export_url(&self, address: &str) -> Result<String> {
        let address = address.trim();
        // Bare IPv6 literals need brackets in a URL
        let host = match address.parse::<Ipv6Addr>() {
            Ok(ip) => format!("[{}]", ip),
            Err(_) => address.to_string(),
        };
        let mut url = Url::parse(&normalize_host(&host, "http"))
            .map_err(|e| BackupError::InvalidEndpoint(format!("{}: {}", address, e)))?;

        if let (Some(port), None) = (self.export_port, url.port()) {
            url.set_port(Some(port)).map_err(|()| {
                BackupError::InvalidEndpoint(format!("{} cannot carry a port", address))
            })?;
        }

        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    /// Directory holding the images and metadata of one set.
    pub fn set_dir(&self, set_id: &str) -> PathBuf {
        self.storage_dir.join(set_id)
    }
}
