//! Restoring a backup set into a new VM.
//!
//! A full set is restored by creating a VM from the captured configuration,
//! one new disk per captured slot in the target storage repository, and
//! importing each image. A diff set first restores its anchor full set, then
//! imports each differencing image onto the restored disk in the same slot.

use super::backup::DiskTransfer;
use super::{Executor, SideEffect, SideEffectLedger};
use crate::inventory::capture_vm;
use crate::meta::{BackupKind, VmConfig, VmMeta};
use crate::resolver::resolve_disk;
use crate::transfer::TransferRequest;
use crate::utils::errors::{BackupError, Result};
use crate::xapi::{NewVbd, NewVdi, NewVif, NewVm, OpaqueRef, XapiError};
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct RestoreReport {
    pub vm: OpaqueRef,
    pub vm_uuid: String,
    pub name: String,
    pub full_set: String,
    pub diff_set: Option<String>,
    pub disks: Vec<DiskTransfer>,
    /// Captured interfaces whose network no longer exists
    pub skipped_vifs: Vec<String>,
}

/// `VM.create` fields for a captured configuration under a new name.
pub fn new_vm_spec(config: &VmConfig, name: &str) -> NewVm {
    NewVm {
        name_label: name.to_string(),
        name_description: config.name_description.clone(),
        user_version: config.user_version,
        memory_target: config.memory_target,
        memory_static_max: config.memory_static_max,
        memory_dynamic_max: config.memory_dynamic_max,
        memory_dynamic_min: config.memory_dynamic_min,
        memory_static_min: config.memory_static_min,
        vcpus_params: config.vcpus_params.clone(),
        vcpus_max: config.vcpus_max,
        vcpus_at_startup: config.vcpus_at_startup,
        actions_after_shutdown: config.actions_after_shutdown.clone(),
        actions_after_reboot: config.actions_after_reboot.clone(),
        actions_after_crash: config.actions_after_crash.clone(),
        pv_bootloader: config.pv_bootloader.clone(),
        pv_kernel: config.pv_kernel.clone(),
        pv_ramdisk: config.pv_ramdisk.clone(),
        pv_args: config.pv_args.clone(),
        pv_bootloader_args: config.pv_bootloader_args.clone(),
        pv_legacy_args: config.pv_legacy_args.clone(),
        hvm_boot_policy: config.hvm_boot_policy.clone(),
        hvm_boot_params: config.hvm_boot_params.clone(),
        hvm_shadow_multiplier: config.hvm_shadow_multiplier,
        platform: config.platform.clone(),
        other_config: config.other_config.clone(),
    }
}

/// State of a restore in progress.
struct Restored {
    vm: OpaqueRef,
    disks: Vec<DiskTransfer>,
    skipped_vifs: Vec<String>,
}

impl Executor {
    /// Restore `set_id` into storage repository `sr_uuid`. Imports go to
    /// `endpoint`, or the pool master when not given.
    pub async fn restore_vm(&self, set_id: &str, sr_uuid: &str, endpoint: Option<&str>) -> Result<RestoreReport> {
        let api = self.api();
        let registry = self.open_registry()?;
        let set = registry
            .find(set_id)
            .ok_or_else(|| BackupError::SetNotFound(set_id.to_string()))?;
        let full_set = registry
            .anchor_for(set)
            .ok_or_else(|| BackupError::NoFullBackup(set.vm_uuid.clone()))?;

        let full_meta = VmMeta::load(self.storage_dir(), &full_set.set_id)?;
        let diff_meta = match set.kind {
            BackupKind::Full => None,
            BackupKind::Diff => Some(VmMeta::load(self.storage_dir(), &set.set_id)?),
        };

        self.check_images(&full_set.set_id, &full_meta.vm)?;
        if let Some(diff) = &diff_meta {
            self.check_images(&set.set_id, &diff.vm)?;
        }

        let sr = api.sr_get_by_uuid(sr_uuid).await?;
        let endpoint = endpoint.unwrap_or(&self.master_url);
        let name = format!("{}{}", full_meta.vm.name_label, self.restore_name_suffix);
        info!(
            "Restoring {} ({}) into SR {} as {}",
            set_id, set.kind, sr_uuid, name
        );

        let mut ledger = SideEffectLedger::default();
        let diff = diff_meta.as_ref().map(|meta| (set_id, meta));
        let result = self
            .restore_sets(&full_set.set_id, &full_meta, diff, &sr, &name, endpoint, &mut ledger)
            .await;

        let restored = match result {
            Ok(restored) => restored,
            Err(e) => {
                error!("Restore of {} failed: {}", set_id, e);
                ledger.report_left_behind("restore");
                return Err(e);
            }
        };

        let vm_uuid = api.vm_get_record(&restored.vm).await?.uuid;
        info!("Restored {} as {} ({})", set_id, name, vm_uuid);

        Ok(RestoreReport {
            vm: restored.vm,
            vm_uuid,
            name,
            full_set: full_set.set_id.clone(),
            diff_set: diff_meta.map(|_| set_id.to_string()),
            disks: restored.disks,
            skipped_vifs: restored.skipped_vifs,
        })
    }

    /// Every image a restore will import must be on disk before anything is
    /// created on the pool.
    fn check_images(&self, set_id: &str, config: &VmConfig) -> Result<()> {
        for disk in config.vbds.iter().filter(|d| !d.vdi.is_empty()) {
            let path = self.set_dir(set_id).join(disk.vdi.file_name());
            if !path.is_file() {
                return Err(BackupError::ImageMissing(path));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn restore_sets(
        &self,
        full_set: &str,
        full_meta: &VmMeta,
        diff: Option<(&str, &VmMeta)>,
        sr: &OpaqueRef,
        name: &str,
        endpoint: &str,
        ledger: &mut SideEffectLedger,
    ) -> Result<Restored> {
        let mut restored = self
            .restore_full(full_set, &full_meta.vm, sr, name, endpoint, ledger)
            .await?;

        if let Some((diff_set, diff_meta)) = diff {
            let disks = self
                .restore_diff(diff_set, &diff_meta.vm, &restored.vm, endpoint)
                .await?;
            restored.disks.extend(disks);
        }

        Ok(restored)
    }

    async fn restore_full(
        &self,
        set_id: &str,
        config: &VmConfig,
        sr: &OpaqueRef,
        name: &str,
        endpoint: &str,
        ledger: &mut SideEffectLedger,
    ) -> Result<Restored> {
        let api = self.api();

        let vm = api.vm_create(&new_vm_spec(config, name)).await?;
        ledger.record(SideEffect::Vm(vm.clone()));
        info!("Created VM {} ({})", name, vm);

        let mut skipped_vifs = Vec::new();
        for vif in &config.vifs {
            let network = if vif.network.uuid.is_empty() {
                None
            } else {
                match api.network_get_by_uuid(&vif.network.uuid).await {
                    Ok(network) => Some(network),
                    Err(XapiError::Rpc { code, .. }) => {
                        warn!(
                            "Network {} ({}) of interface {} is gone ({}), skipping",
                            vif.network.name_label, vif.network.uuid, vif.device, code
                        );
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            let Some(network) = network else {
                skipped_vifs.push(vif.device.clone());
                continue;
            };

            let created = api
                .vif_create(&NewVif {
                    vm: vm.clone(),
                    network,
                    device: vif.device.clone(),
                    mac: vif.mac.clone(),
                    mtu: vif.mtu,
                })
                .await?;
            ledger.record(SideEffect::Vif(created.clone()));
            info!("Created VIF {} on {}", created, vif.network.name_label);
        }

        let set_dir = self.set_dir(set_id);
        let mut disks = Vec::new();
        for disk in config.vbds.iter().filter(|d| !d.vdi.is_empty()) {
            let vdi = api
                .vdi_create(&NewVdi {
                    sr: sr.clone(),
                    name_label: disk.vdi.name_label.clone(),
                    name_description: disk.vdi.name_description.clone(),
                    virtual_size: disk.vdi.virtual_size,
                    vdi_type: disk.vdi.kind.clone(),
                    sharable: disk.vdi.sharable,
                    read_only: disk.vdi.read_only,
                })
                .await?;
            ledger.record(SideEffect::Vdi(vdi.clone()));

            let vbd = api
                .vbd_create(&NewVbd {
                    vm: vm.clone(),
                    vdi: vdi.clone(),
                    userdevice: disk.userdevice.clone(),
                    device: disk.device.clone(),
                    bootable: disk.bootable,
                })
                .await?;
            ledger.record(SideEffect::Vbd(vbd.clone()));
            info!("Created VDI {} in slot {} ({})", vdi, disk.userdevice, vbd);

            let request = TransferRequest::import(endpoint, vdi, set_dir.join(disk.vdi.file_name()));
            let outcome = self.transfer.transfer(api, &request).await?;
            disks.push(DiskTransfer {
                userdevice: disk.userdevice.clone(),
                vdi_uuid: disk.vdi.uuid.clone(),
                outcome,
            });
        }

        Ok(Restored {
            vm,
            disks,
            skipped_vifs,
        })
    }

    /// Merge a diff set's images onto the disks of an already restored VM,
    /// matched by slot.
    async fn restore_diff(
        &self,
        set_id: &str,
        config: &VmConfig,
        vm: &OpaqueRef,
        endpoint: &str,
    ) -> Result<Vec<DiskTransfer>> {
        let api = self.api();
        let live = capture_vm(api, vm).await?;
        let set_dir = self.set_dir(set_id);

        let mut disks = Vec::new();
        for disk in config.vbds.iter().filter(|d| !d.vdi.is_empty()) {
            let target = resolve_disk(&live, &disk.userdevice)?;
            let request = TransferRequest::import(
                endpoint,
                OpaqueRef::new(target.vdi.vdi.clone()),
                set_dir.join(disk.vdi.file_name()),
            );
            let outcome = self.transfer.transfer(api, &request).await?;
            disks.push(DiskTransfer {
                userdevice: disk.userdevice.clone(),
                vdi_uuid: disk.vdi.uuid.clone(),
                outcome,
            });
        }

        Ok(disks)
    }
}
