//! Deleting backup sets.
//!
//! Removes a set's record from the registry and its directory from the
//! storage root. Snapshots retained on the pool are left alone.

use super::Executor;
use crate::registry::{BackupSet, BackupSetRegistry};
use crate::utils::errors::Result;
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Set id that selects every registered set.
pub const ALL_SETS: &str = "all";

#[derive(Debug, Default)]
pub struct DeleteReport {
    pub removed: Vec<BackupSet>,
    /// Diff sets left without their anchor full set
    pub orphaned_diffs: Vec<String>,
}

/// Delete one set, or every set for [`ALL_SETS`]. The registry is rewritten
/// before any directory is removed, so a crash never leaves a registered set
/// without its files.
pub fn delete_backup_set(
    storage_dir: &Path,
    registry: &mut BackupSetRegistry,
    set_id: &str,
) -> Result<DeleteReport> {
    let mut report = DeleteReport::default();

    if set_id == ALL_SETS {
        report.removed = registry.clear()?;
    } else {
        let anchored: Vec<String> = registry
            .anchored_diffs(set_id)
            .into_iter()
            .map(|set| set.set_id.clone())
            .collect();
        report.removed.push(registry.remove(set_id)?);
        if !anchored.is_empty() {
            warn!(
                "Full set {} anchored {} diff set(s) that can no longer be restored: {}",
                set_id,
                anchored.len(),
                anchored.join(", ")
            );
        }
        report.orphaned_diffs = anchored;
    }

    for set in &report.removed {
        remove_set_dir(&storage_dir.join(&set.set_id))?;
        info!("Deleted backup set {} ({}, {})", set.set_id, set.kind, set.vm_uuid);
    }

    Ok(report)
}

fn remove_set_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Set directory {} was already gone", dir.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl Executor {
    pub fn delete_set(&self, set_id: &str) -> Result<DeleteReport> {
        let mut registry = self.open_registry()?;
        delete_backup_set(self.storage_dir(), &mut registry, set_id)
    }
}
