//! Object records as returned by the management API, plus the creation
//! specs the engine sends back.
//!
//! Field names follow the wire format (`VBDs`, `VCPUs_max`, `PV_kernel`...).
//! Missing fields fall back to their defaults so older pool versions decode.

use super::OpaqueRef;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Full VM record (subset the engine uses).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VmRecord {
    pub uuid: String,
    pub allowed_operations: Vec<String>,
    pub power_state: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(deserialize_with = "lenient::int")]
    pub user_version: i64,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub is_control_domain: bool,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_overhead: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_target: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_static_max: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_dynamic_max: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_dynamic_min: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub memory_static_min: i64,
    #[serde(rename = "VCPUs_params")]
    pub vcpus_params: BTreeMap<String, String>,
    #[serde(rename = "VCPUs_max", deserialize_with = "lenient::int")]
    pub vcpus_max: i64,
    #[serde(rename = "VCPUs_at_startup", deserialize_with = "lenient::int")]
    pub vcpus_at_startup: i64,
    pub actions_after_shutdown: String,
    pub actions_after_reboot: String,
    pub actions_after_crash: String,
    #[serde(rename = "PV_bootloader")]
    pub pv_bootloader: String,
    #[serde(rename = "PV_kernel")]
    pub pv_kernel: String,
    #[serde(rename = "PV_ramdisk")]
    pub pv_ramdisk: String,
    #[serde(rename = "PV_args")]
    pub pv_args: String,
    #[serde(rename = "PV_bootloader_args")]
    pub pv_bootloader_args: String,
    #[serde(rename = "PV_legacy_args")]
    pub pv_legacy_args: String,
    #[serde(rename = "HVM_boot_policy")]
    pub hvm_boot_policy: String,
    #[serde(rename = "HVM_boot_params")]
    pub hvm_boot_params: BTreeMap<String, String>,
    #[serde(rename = "HVM_shadow_multiplier", deserialize_with = "lenient::float")]
    pub hvm_shadow_multiplier: f64,
    pub platform: BTreeMap<String, String>,
    pub other_config: BTreeMap<String, String>,
    #[serde(rename = "VBDs")]
    pub vbds: Vec<OpaqueRef>,
    #[serde(rename = "VIFs")]
    pub vifs: Vec<OpaqueRef>,
    pub affinity: OpaqueRef,
    pub resident_on: OpaqueRef,
}

/// Virtual block device: binds a VDI to a VM slot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VbdRecord {
    pub uuid: String,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
    #[serde(rename = "VDI")]
    pub vdi: OpaqueRef,
    pub device: String,
    pub userdevice: String,
    pub bootable: bool,
    pub mode: String,
    #[serde(rename = "type")]
    pub vbd_type: String,
    pub empty: bool,
}

impl VbdRecord {
    /// Disk attachments (as opposed to CD drives and floppies).
    pub fn is_disk(&self) -> bool {
        self.vbd_type.eq_ignore_ascii_case("disk")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "SR")]
    pub sr: OpaqueRef,
    #[serde(deserialize_with = "lenient::int")]
    pub virtual_size: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub physical_utilisation: i64,
    #[serde(rename = "type")]
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VifRecord {
    pub uuid: String,
    pub device: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "MTU", deserialize_with = "lenient::int")]
    pub mtu: i64,
    pub network: OpaqueRef,
    #[serde(rename = "VM")]
    pub vm: OpaqueRef,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "MTU", deserialize_with = "lenient::int")]
    pub mtu: i64,
    pub bridge: String,
    pub managed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub hostname: String,
    pub address: String,
    #[serde(rename = "PIFs")]
    pub pifs: Vec<OpaqueRef>,
}

/// Physical interface of a host.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PifRecord {
    pub uuid: String,
    pub device: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub currently_attached: bool,
}

/// Storage repository.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    #[serde(rename = "type")]
    pub sr_type: String,
    #[serde(deserialize_with = "lenient::int")]
    pub physical_size: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub physical_utilisation: i64,
}

/// Fields sent to `VM.create`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVm {
    pub name_label: String,
    pub name_description: String,
    pub user_version: i64,
    pub memory_target: i64,
    pub memory_static_max: i64,
    pub memory_dynamic_max: i64,
    pub memory_dynamic_min: i64,
    pub memory_static_min: i64,
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
    pub hvm_boot_params: BTreeMap<String, String>,
    pub hvm_shadow_multiplier: f64,
    pub platform: BTreeMap<String, String>,
    pub other_config: BTreeMap<String, String>,
}

/// Fields sent to `VDI.create`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVdi {
    pub sr: OpaqueRef,
    pub name_label: String,
    pub name_description: String,
    pub virtual_size: i64,
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
}

/// Fields sent to `VBD.create`. Always a read/write disk attachment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVbd {
    pub vm: OpaqueRef,
    pub vdi: OpaqueRef,
    pub userdevice: String,
    pub device: String,
    pub bootable: bool,
}

/// Fields sent to `VIF.create`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVif {
    pub vm: OpaqueRef,
    pub network: OpaqueRef,
    pub device: String,
    pub mac: String,
    pub mtu: i64,
}

/// Decoders for numeric fields that some pool versions send as strings.
pub(crate) mod lenient {
    use super::*;
    use serde::de::Error;
    use serde_json::Value;

    pub fn int<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| D::Error::custom(format!("integer out of range: {}", n))),
            Value::String(s) if s.is_empty() => Ok(0),
            Value::String(s) => s
                .parse()
                .map_err(|_| D::Error::custom(format!("not an integer: {}", s))),
            Value::Null => Ok(0),
            other => Err(D::Error::custom(format!("expected integer, got {}", other))),
        }
    }

    pub fn float<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom(format!("not a float: {}", n))),
            Value::String(s) if s.is_empty() => Ok(0.0),
            Value::String(s) => s
                .parse()
                .map_err(|_| D::Error::custom(format!("not a float: {}", s))),
            Value::Null => Ok(0.0),
            other => Err(D::Error::custom(format!("expected float, got {}", other))),
        }
    }
}
