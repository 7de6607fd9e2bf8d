//! Point-in-time snapshots of a VM.
//!
//! A full backup keeps its snapshot as the base for later diffs; a diff
//! backup destroys its snapshot once the images are exported. A
//! [`Snapshot`] handle must end in exactly one of [`destroy_snapshot`] or
//! [`Snapshot::retain`].

use crate::utils::errors::Result;
use crate::xapi::{OpaqueRef, XenApi};
use chrono::{DateTime, Local};
use tracing::{debug, info};

/// Timestamp format shared by snapshot names, set ids and registry dates.
pub const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn format_date(at: DateTime<Local>) -> String {
    at.format(DATE_FORMAT).to_string()
}

/// `{vm_uuid}_{YYYYMMDDHHMMSS}`; also the backup set id.
pub fn snapshot_name(vm_uuid: &str, date: &str) -> String {
    format!("{}_{}", vm_uuid, date)
}

/// A snapshot owned by an in-flight backup.
#[derive(Debug)]
#[must_use = "a snapshot must be destroyed or retained"]
pub struct Snapshot {
    pub vm: OpaqueRef,
    pub snapshot: OpaqueRef,
    pub name: String,
}

impl Snapshot {
    /// Keep the snapshot on the pool and give up ownership.
    pub fn retain(self) -> OpaqueRef {
        info!("Retaining snapshot {} ({})", self.name, self.snapshot);
        self.snapshot
    }
}

pub async fn create_snapshot(api: &dyn XenApi, vm: &OpaqueRef, name: &str) -> Result<Snapshot> {
    let snapshot = api.vm_snapshot(vm, name).await?;
    info!("Created snapshot {} ({}) of {}", name, snapshot, vm);

    Ok(Snapshot {
        vm: vm.clone(),
        snapshot,
        name: name.to_string(),
    })
}

/// Tear a snapshot down: each disk attachment is detached and its image
/// destroyed, then the VM object goes. Other attachment kinds (CD drives)
/// are left to the VM destroy. The first failing call aborts the teardown.
pub async fn destroy_snapshot(api: &dyn XenApi, snapshot: Snapshot) -> Result<()> {
    let record = api.vm_get_record(&snapshot.snapshot).await?;

    for vbd_ref in &record.vbds {
        let vbd = api.vbd_get_record(vbd_ref).await?;
        if !vbd.is_disk() {
            debug!("Skipping {} attachment {}", vbd.vbd_type, vbd_ref);
            continue;
        }

        api.vbd_destroy(vbd_ref).await?;
        info!("Destroyed VBD {} (slot {})", vbd_ref, vbd.userdevice);

        if !vbd.vdi.is_null() {
            api.vdi_destroy(&vbd.vdi).await?;
            info!("Destroyed VDI {}", vbd.vdi);
        }
    }

    api.vm_destroy(&snapshot.snapshot).await?;
    info!("Destroyed snapshot {} ({})", snapshot.name, snapshot.snapshot);

    Ok(())
}
