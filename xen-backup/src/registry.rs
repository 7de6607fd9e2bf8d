//! Backup set registry (`backup_set.json`).
//!
//! An ordered list of backup generations, one document for the whole storage
//! root. Insertion order is meaningful: the anchor of a diff is found by
//! scanning backwards for the most recent full of the same VM.
//!
//! Every mutation rewrites the whole file atomically. There is no locking;
//! callers must not run two writers against the same registry.

use crate::meta::BackupKind;
use crate::utils::errors::{BackupError, Result};
use crate::utils::fs::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE: &str = "backup_set.json";

/// One backup generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    pub set_id: String,
    pub vm_uuid: String,
    /// `YYYYMMDDHHMMSS`
    pub date: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    sets: Vec<BackupSet>,
}

#[derive(Debug)]
pub struct BackupSetRegistry {
    path: PathBuf,
    sets: Vec<BackupSet>,
}

impl BackupSetRegistry {
    /// Load the registry at `path`. A missing or empty file is an empty
    /// registry; a file that does not parse is an error and is left alone.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sets = match std::fs::read(&path) {
            Ok(body) if body.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(body) => {
                let doc: RegistryDocument = serde_json::from_slice(&body)
                    .map_err(|source| BackupError::Metadata {
                        path: path.clone(),
                        source,
                    })?;
                doc.sets
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, sets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All sets in insertion order.
    pub fn sets(&self) -> &[BackupSet] {
        &self.sets
    }

    pub fn find(&self, set_id: &str) -> Option<&BackupSet> {
        self.sets.iter().find(|s| s.set_id == set_id)
    }

    /// Most recently inserted full backup of `vm_uuid`.
    pub fn latest_full(&self, vm_uuid: &str) -> Option<&BackupSet> {
        self.sets
            .iter()
            .rev()
            .find(|s| s.vm_uuid == vm_uuid && s.kind == BackupKind::Full)
    }

    /// The full backup a diff was taken against: the most recent full of the
    /// same VM inserted before it. A full is its own anchor.
    pub fn anchor_for(&self, set: &BackupSet) -> Option<&BackupSet> {
        if set.kind == BackupKind::Full {
            return self.find(&set.set_id);
        }
        let position = self.sets.iter().position(|s| s.set_id == set.set_id)?;
        self.sets[..position]
            .iter()
            .rev()
            .find(|s| s.vm_uuid == set.vm_uuid && s.kind == BackupKind::Full)
    }

    /// Diffs whose anchor is the full set `full_id`.
    pub fn anchored_diffs(&self, full_id: &str) -> Vec<&BackupSet> {
        self.sets
            .iter()
            .filter(|s| s.kind == BackupKind::Diff)
            .filter(|s| self.anchor_for(s).map(|a| a.set_id.as_str()) == Some(full_id))
            .collect()
    }

    /// Append a set and persist. This is the commit point of a backup.
    /// Set ids are unique.
    pub fn append(&mut self, set: BackupSet) -> Result<()> {
        if self.find(&set.set_id).is_some() {
            return Err(BackupError::SetExists(set.set_id));
        }
        self.sets.push(set);
        if let Err(e) = self.persist() {
            self.sets.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Remove one set and persist.
    pub fn remove(&mut self, set_id: &str) -> Result<BackupSet> {
        let position = self
            .sets
            .iter()
            .position(|s| s.set_id == set_id)
            .ok_or_else(|| BackupError::SetNotFound(set_id.to_string()))?;

        let removed = self.sets.remove(position);
        if let Err(e) = self.persist() {
            self.sets.insert(position, removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Drop every set and persist an empty list.
    pub fn clear(&mut self) -> Result<Vec<BackupSet>> {
        let removed = std::mem::take(&mut self.sets);
        if let Err(e) = self.persist() {
            self.sets = removed;
            return Err(e);
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let doc = RegistryDocument {
            sets: self.sets.clone(),
        };
        let body = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.path, &body)?;
        Ok(())
    }
}
