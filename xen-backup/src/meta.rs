//! Per-set VM metadata (`{storage}/{set_id}/vm_meta.json`).
//!
//! The document captures the VM configuration of one backup generation so a
//! restore can rebuild the VM without the original being present. Key/value
//! maps are stored as `[{"key": .., "value": ..}]` lists.

use crate::utils::errors::{BackupError, Result};
use crate::utils::fs::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const VM_META_FILE: &str = "vm_meta.json";

/// Kind of a backup generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Diff,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => f.pad("full"),
            BackupKind::Diff => f.pad("diff"),
        }
    }
}

/// Disk image descriptor as captured at backup time.
///
/// `vdi` is the reference that was valid during the backup call. It is kept
/// for the operator's benefit only; lookups go through `uuid` or the slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskImage {
    pub vdi: String,
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub virtual_size: i64,
    pub physical_utilisation: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub sharable: bool,
    pub read_only: bool,
}

impl DiskImage {
    /// Attachments without a backing image carry an empty descriptor.
    pub fn is_empty(&self) -> bool {
        self.uuid.is_empty()
    }

    /// File name of this image inside a set directory.
    pub fn file_name(&self) -> String {
        format!("{}.vhd", self.uuid)
    }
}

/// A disk attachment (VBD) and the image behind it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskAttachment {
    pub uuid: String,
    pub bootable: bool,
    pub device: String,
    pub userdevice: String,
    pub vdi: DiskImage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfo {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub mtu: i64,
    pub bridge: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAttachment {
    pub uuid: String,
    pub device: String,
    pub mac: String,
    pub mtu: i64,
    pub network: NetworkInfo,
}

/// VM configuration as captured from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub uuid: String,
    pub allowed_operations: Vec<String>,
    pub power_state: String,
    pub name_label: String,
    pub name_description: String,
    pub user_version: i64,
    pub is_a_template: bool,
    pub memory_overhead: i64,
    pub memory_target: i64,
    pub memory_static_max: i64,
    pub memory_dynamic_max: i64,
    pub memory_dynamic_min: i64,
    pub memory_static_min: i64,
    #[serde(with = "kv_list")]
    pub vcpus_params: BTreeMap<String, String>,
    pub vcpus_max: i64,
    pub vcpus_at_startup: i64,
    pub actions_after_shutdown: String,
    pub actions_after_reboot: String,
    pub actions_after_crash: String,
    pub pv_bootloader: String,
    pub pv_kernel: String,
    pub pv_ramdisk: String,
    pub pv_args: String,
    pub pv_bootloader_args: String,
    pub pv_legacy_args: String,
    pub hvm_boot_policy: String,
    #[serde(with = "kv_list")]
    pub hvm_boot_params: BTreeMap<String, String>,
    pub hvm_shadow_multiplier: f64,
    #[serde(with = "kv_list")]
    pub platform: BTreeMap<String, String>,
    #[serde(with = "kv_list")]
    pub other_config: BTreeMap<String, String>,
    pub vbds: Vec<DiskAttachment>,
    pub vifs: Vec<NetworkAttachment>,
}

/// The `vm_meta.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMeta {
    pub date: String,
    pub vm_name: String,
    pub vm_uuid: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub vm: VmConfig,
}

impl VmMeta {
    pub fn path(storage_dir: &Path, set_id: &str) -> PathBuf {
        storage_dir.join(set_id).join(VM_META_FILE)
    }

    /// Load the metadata of `set_id`. A missing file is an error here:
    /// restore cannot proceed without it.
    pub fn load(storage_dir: &Path, set_id: &str) -> Result<Self> {
        let path = Self::path(storage_dir, set_id);
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::MetadataMissing(path));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&body).map_err(|source| BackupError::Metadata { path, source })
    }

    pub fn save(&self, storage_dir: &Path, set_id: &str) -> Result<PathBuf> {
        let path = Self::path(storage_dir, set_id);
        let body = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &body)?;
        Ok(path)
    }
}

/// Serde adapter for string maps stored as `[{"key": k, "value": v}]`.
///
/// Plain JSON objects are accepted on read as well.
mod kv_list {
    use serde::de::Deserializer;
    use serde::ser::{SerializeSeq, Serializer};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        key: String,
        value: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Entry>),
        Map(BTreeMap<String, String>),
        Null(()),
    }

    pub fn serialize<S>(map: &BTreeMap<String, String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(map.len()))?;
        for (key, value) in map {
            seq.serialize_element(&Entry {
                key: key.clone(),
                value: value.clone(),
            })?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::List(entries) => entries.into_iter().map(|e| (e.key, e.value)).collect(),
            Repr::Map(map) => map,
            Repr::Null(()) => BTreeMap::new(),
        })
    }
}
