//! Full and differential backups.
//!
//! A backup snapshots the VM, exports every disk of the snapshot into
//! `{storage}/{set_id}/{vdi_uuid}.vhd`, writes `vm_meta.json` and appends the
//! set to the registry. The registry append is the commit point: a failure
//! before it leaves no record behind.
//!
//! A diff exports each disk relative to the disk in the same slot of the
//! latest full backup's snapshot, which full backups keep on the pool for
//! exactly this purpose. The diff's own snapshot is destroyed afterwards.

use super::{Executor, SideEffect, SideEffectLedger};
use crate::inventory::{capture_vm, disk_host, host_endpoints, EndpointChoice};
use crate::meta::{BackupKind, VmMeta};
use crate::registry::{BackupSet, BackupSetRegistry};
use crate::resolver::resolve_disk;
use crate::snapshot::{create_snapshot, destroy_snapshot, format_date, snapshot_name, Snapshot};
use crate::transfer::{TransferOutcome, TransferRequest};
use crate::utils::errors::{BackupError, Result};
use crate::xapi::{OpaqueRef, VmRecord};
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SET_ID_ATTEMPTS: usize = 12;
const SET_ID_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One exported or imported disk.
#[derive(Debug, Clone)]
pub struct DiskTransfer {
    pub userdevice: String,
    pub vdi_uuid: String,
    pub outcome: TransferOutcome,
}

#[derive(Debug)]
pub struct BackupReport {
    pub set: BackupSet,
    pub meta_path: PathBuf,
    pub disks: Vec<DiskTransfer>,
    /// Full backups keep their snapshot as the base for later diffs
    pub retained_snapshot: Option<OpaqueRef>,
    /// Cleanup that failed after the backup was committed
    pub leftovers: Vec<SideEffect>,
}

/// What was committed before the snapshot is dealt with.
struct Committed {
    set: BackupSet,
    meta_path: PathBuf,
    disks: Vec<DiskTransfer>,
}

impl Executor {
    /// Addresses the VM's disks can be exported through.
    pub async fn endpoints_for(&self, vm_uuid: &str) -> Result<Vec<String>> {
        let api = self.api();
        let vm = api.vm_get_by_uuid(vm_uuid).await?;
        let record = api.vm_get_record(&vm).await?;
        host_endpoints(api, &disk_host(&record)?).await
    }

    pub async fn backup_full(&self, vm_uuid: &str, endpoint: &EndpointChoice) -> Result<BackupReport> {
        self.run_backup(vm_uuid, BackupKind::Full, endpoint).await
    }

    pub async fn backup_diff(&self, vm_uuid: &str, endpoint: &EndpointChoice) -> Result<BackupReport> {
        self.run_backup(vm_uuid, BackupKind::Diff, endpoint).await
    }

    pub async fn run_backup(
        &self,
        vm_uuid: &str,
        kind: BackupKind,
        endpoint: &EndpointChoice,
    ) -> Result<BackupReport> {
        let api = self.api();
        let mut registry = self.open_registry()?;

        // Everything that can be checked without touching the pool goes first
        let anchor = match kind {
            BackupKind::Full => None,
            BackupKind::Diff => {
                let full = registry
                    .latest_full(vm_uuid)
                    .ok_or_else(|| BackupError::NoFullBackup(vm_uuid.to_string()))?;
                info!("Diff backup of {} against {}", vm_uuid, full.set_id);
                Some(VmMeta::load(self.storage_dir(), &full.set_id)?)
            }
        };

        let vm = api.vm_get_by_uuid(vm_uuid).await?;
        let live = api.vm_get_record(&vm).await?;
        let addresses = host_endpoints(api, &disk_host(&live)?).await?;
        let export_url = self.export_url(&endpoint.choose(&addresses)?)?;

        let (date, name) = self.unused_set_id(&registry, vm_uuid).await?;
        info!("Starting {} backup of {} ({}) as {}", kind, live.name_label, vm_uuid, name);

        let snapshot = create_snapshot(api, &vm, &name).await?;
        let mut ledger = SideEffectLedger::default();
        ledger.record(SideEffect::Snapshot {
            name: snapshot.name.clone(),
            reference: snapshot.snapshot.clone(),
        });

        let committed = match self
            .export_and_commit(
                &mut registry,
                &snapshot,
                &live,
                vm_uuid,
                kind,
                &date,
                anchor.as_ref(),
                &export_url,
                &mut ledger,
            )
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                error!("{} backup of {} failed: {}", kind, vm_uuid, e);
                self.abandon(snapshot, &mut ledger).await;
                ledger.report_left_behind("backup");
                return Err(e);
            }
        };

        let mut leftovers = Vec::new();
        let retained_snapshot = match kind {
            BackupKind::Full => Some(snapshot.retain()),
            BackupKind::Diff => {
                let effect = SideEffect::Snapshot {
                    name: snapshot.name.clone(),
                    reference: snapshot.snapshot.clone(),
                };
                if let Err(e) = destroy_snapshot(api, snapshot).await {
                    // The set is already committed; the snapshot is only garbage now
                    error!(
                        "Backup {} committed but its snapshot was not destroyed: {}",
                        committed.set.set_id, e
                    );
                    warn!("  left behind: {}", effect);
                    leftovers.push(effect);
                }
                None
            }
        };

        info!(
            "{} backup {} complete: {} disk(s)",
            kind,
            committed.set.set_id,
            committed.disks.len()
        );

        Ok(BackupReport {
            set: committed.set,
            meta_path: committed.meta_path,
            disks: committed.disks,
            retained_snapshot,
            leftovers,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn export_and_commit(
        &self,
        registry: &mut BackupSetRegistry,
        snapshot: &Snapshot,
        live: &VmRecord,
        vm_uuid: &str,
        kind: BackupKind,
        date: &str,
        anchor: Option<&VmMeta>,
        export_url: &str,
        ledger: &mut SideEffectLedger,
    ) -> Result<Committed> {
        let api = self.api();
        let mut config = capture_vm(api, &snapshot.snapshot).await?;
        // Snapshots carry a generated name; the set records the VM's own
        config.name_label = live.name_label.clone();
        config.name_description = live.name_description.clone();

        // Resolve every base before exporting anything
        let mut plan = Vec::with_capacity(config.vbds.len());
        for disk in &config.vbds {
            if disk.vdi.is_empty() {
                warn!("Slot {} has no disk image, skipping", disk.userdevice);
                continue;
            }
            let base = match anchor {
                None => None,
                Some(full) => {
                    let base_disk = resolve_disk(&full.vm, &disk.userdevice)?;
                    Some(api.vdi_get_by_uuid(&base_disk.vdi.uuid).await?)
                }
            };
            plan.push((disk, base));
        }

        let set_dir = self.set_dir(&snapshot.name);
        tokio::fs::create_dir_all(self.storage_dir()).await?;
        // Never write into another set's directory
        tokio::fs::create_dir(&set_dir).await?;
        let dir_effect = SideEffect::LocalDir(set_dir.clone());
        ledger.record(dir_effect.clone());

        let mut disks = Vec::with_capacity(plan.len());
        for (disk, base) in plan {
            let request = TransferRequest::export(
                export_url,
                OpaqueRef::new(disk.vdi.vdi.clone()),
                base,
                set_dir.join(disk.vdi.file_name()),
            );
            let outcome = self.transfer.transfer(api, &request).await?;
            disks.push(DiskTransfer {
                userdevice: disk.userdevice.clone(),
                vdi_uuid: disk.vdi.uuid.clone(),
                outcome,
            });
        }

        let meta = VmMeta {
            date: date.to_string(),
            vm_name: live.name_label.clone(),
            vm_uuid: vm_uuid.to_string(),
            kind,
            vm: config,
        };
        let meta_path = meta.save(self.storage_dir(), &snapshot.name)?;

        let set = BackupSet {
            set_id: snapshot.name.clone(),
            vm_uuid: vm_uuid.to_string(),
            date: date.to_string(),
            kind,
        };
        registry.append(set.clone())?;
        ledger.forget(&dir_effect);
        info!("Registered backup set {}", set.set_id);

        Ok(Committed {
            set,
            meta_path,
            disks,
        })
    }

    /// Date and set id for a new backup. Ids have one-second resolution, so a
    /// second backup of the same VM within that second waits for the next one.
    async fn unused_set_id(&self, registry: &BackupSetRegistry, vm_uuid: &str) -> Result<(String, String)> {
        let mut name = String::new();
        for _ in 0..SET_ID_ATTEMPTS {
            let date = format_date(Local::now());
            name = snapshot_name(vm_uuid, &date);
            let taken = registry.find(&name).is_some()
                || tokio::fs::try_exists(self.set_dir(&name)).await?;
            if !taken {
                return Ok((date, name));
            }
            debug!("Set id {} is taken, waiting", name);
            tokio::time::sleep(SET_ID_RETRY_DELAY).await;
        }
        Err(BackupError::SetExists(name))
    }

    /// Best-effort teardown of a failed backup's snapshot.
    async fn abandon(&self, snapshot: Snapshot, ledger: &mut SideEffectLedger) {
        let effect = SideEffect::Snapshot {
            name: snapshot.name.clone(),
            reference: snapshot.snapshot.clone(),
        };
        match destroy_snapshot(self.api(), snapshot).await {
            Ok(()) => ledger.forget(&effect),
            Err(e) => warn!("Could not destroy snapshot after failed backup: {}", e),
        }
    }
}
