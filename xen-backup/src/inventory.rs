//! Reading the pool: VM configuration capture, data-plane endpoints of a
//! host, and the listings the CLI prints.

use crate::meta::{DiskAttachment, DiskImage, NetworkAttachment, NetworkInfo, VmConfig};
use crate::utils::errors::{BackupError, Result};
use crate::xapi::{NetworkRecord, OpaqueRef, SrRecord, VmRecord, XenApi};
use tracing::debug;

/// Storage repository types that never hold VM disks.
const NON_DISK_SR_TYPES: &[&str] = &["iso", "udev"];

/// VM attributes without attachments.
pub fn config_from_record(record: &VmRecord) -> VmConfig {
    VmConfig {
        uuid: record.uuid.clone(),
        allowed_operations: record.allowed_operations.clone(),
        power_state: record.power_state.clone(),
        name_label: record.name_label.clone(),
        name_description: record.name_description.clone(),
        user_version: record.user_version,
        is_a_template: record.is_a_template,
        memory_overhead: record.memory_overhead,
        memory_target: record.memory_target,
        memory_static_max: record.memory_static_max,
        memory_dynamic_max: record.memory_dynamic_max,
        memory_dynamic_min: record.memory_dynamic_min,
        memory_static_min: record.memory_static_min,
        vcpus_params: record.vcpus_params.clone(),
        vcpus_max: record.vcpus_max,
        vcpus_at_startup: record.vcpus_at_startup,
        actions_after_shutdown: record.actions_after_shutdown.clone(),
        actions_after_reboot: record.actions_after_reboot.clone(),
        actions_after_crash: record.actions_after_crash.clone(),
        pv_bootloader: record.pv_bootloader.clone(),
        pv_kernel: record.pv_kernel.clone(),
        pv_ramdisk: record.pv_ramdisk.clone(),
        pv_args: record.pv_args.clone(),
        pv_bootloader_args: record.pv_bootloader_args.clone(),
        pv_legacy_args: record.pv_legacy_args.clone(),
        hvm_boot_policy: record.hvm_boot_policy.clone(),
        hvm_boot_params: record.hvm_boot_params.clone(),
        hvm_shadow_multiplier: record.hvm_shadow_multiplier,
        platform: record.platform.clone(),
        other_config: record.other_config.clone(),
        vbds: Vec::new(),
        vifs: Vec::new(),
    }
}

/// Capture a VM (or snapshot) with its disk attachments and network
/// interfaces, in attachment order.
pub async fn capture_vm(api: &dyn XenApi, vm: &OpaqueRef) -> Result<VmConfig> {
    let record = api.vm_get_record(vm).await?;
    let mut config = config_from_record(&record);

    for vbd_ref in &record.vbds {
        let vbd = api.vbd_get_record(vbd_ref).await?;
        if !vbd.is_disk() {
            continue;
        }

        let vdi = if vbd.vdi.is_null() {
            DiskImage::default()
        } else {
            let image = api.vdi_get_record(&vbd.vdi).await?;
            DiskImage {
                vdi: vbd.vdi.to_string(),
                uuid: image.uuid,
                name_label: image.name_label,
                name_description: image.name_description,
                virtual_size: image.virtual_size,
                physical_utilisation: image.physical_utilisation,
                kind: image.vdi_type,
                sharable: image.sharable,
                read_only: image.read_only,
            }
        };

        config.vbds.push(DiskAttachment {
            uuid: vbd.uuid,
            bootable: vbd.bootable,
            device: vbd.device,
            userdevice: vbd.userdevice,
            vdi,
        });
    }

    for vif_ref in &record.vifs {
        let vif = api.vif_get_record(vif_ref).await?;
        let network = if vif.network.is_null() {
            NetworkInfo::default()
        } else {
            let net = api.network_get_record(&vif.network).await?;
            NetworkInfo {
                uuid: net.uuid,
                name_label: net.name_label,
                name_description: net.name_description,
                mtu: net.mtu,
                bridge: net.bridge,
            }
        };

        config.vifs.push(NetworkAttachment {
            uuid: vif.uuid,
            device: vif.device,
            mac: vif.mac,
            mtu: vif.mtu,
            network,
        });
    }

    debug!(
        "Captured {} ({} disks, {} interfaces)",
        config.uuid,
        config.vbds.len(),
        config.vifs.len()
    );
    Ok(config)
}

/// The host whose data-plane serves a VM's disks: its affinity, or the host
/// it is running on.
pub fn disk_host(record: &VmRecord) -> Result<OpaqueRef> {
    [&record.affinity, &record.resident_on]
        .into_iter()
        .find(|host| !host.is_null())
        .cloned()
        .ok_or_else(|| {
            BackupError::NoEndpoint(format!(
                "vm {} has neither an affinity nor a resident host",
                record.uuid
            ))
        })
}

/// IP addresses of the host's currently attached interfaces.
pub async fn host_endpoints(api: &dyn XenApi, host: &OpaqueRef) -> Result<Vec<String>> {
    let record = api.host_get_record(host).await?;
    let mut addresses = Vec::new();

    for pif_ref in &record.pifs {
        let pif = api.pif_get_record(pif_ref).await?;
        if pif.currently_attached && !pif.ip.is_empty() {
            addresses.push(pif.ip);
        }
    }

    Ok(addresses)
}

/// How to pick one export endpoint out of a host's addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointChoice {
    /// A specific address, which must be one of the host's
    Address(String),
    /// Position in the discovered list
    Index(usize),
    /// The host's single address
    Only,
}

impl EndpointChoice {
    pub fn choose(&self, addresses: &[String]) -> Result<String> {
        match self {
            EndpointChoice::Address(addr) => addresses
                .iter()
                .find(|a| *a == addr)
                .cloned()
                .ok_or_else(|| {
                    BackupError::InvalidEndpoint(format!(
                        "{} is not an attached address of the host (have: {})",
                        addr,
                        addresses.join(", ")
                    ))
                }),
            EndpointChoice::Index(index) => addresses.get(*index).cloned().ok_or_else(|| {
                BackupError::InvalidEndpoint(format!(
                    "index {} out of range ({} addresses)",
                    index,
                    addresses.len()
                ))
            }),
            EndpointChoice::Only => match addresses {
                [] => Err(BackupError::NoEndpoint(
                    "host has no attached interface with an address".to_string(),
                )),
                [only] => Ok(only.clone()),
                _ => Err(BackupError::InvalidEndpoint(format!(
                    "host has {} addresses, pick one: {}",
                    addresses.len(),
                    addresses.join(", ")
                ))),
            },
        }
    }
}

/// Regular VMs: no templates, snapshots or control domains.
pub async fn list_vms(api: &dyn XenApi) -> Result<Vec<VmRecord>> {
    let mut vms: Vec<VmRecord> = api
        .vm_get_all_records()
        .await?
        .into_iter()
        .map(|(_, vm)| vm)
        .filter(|vm| !vm.is_a_template && !vm.is_a_snapshot && !vm.is_control_domain)
        .collect();
    vms.sort_by(|a, b| a.name_label.cmp(&b.name_label));
    Ok(vms)
}

/// Storage repositories that can hold disks.
pub async fn list_srs(api: &dyn XenApi) -> Result<Vec<SrRecord>> {
    let mut srs: Vec<SrRecord> = api
        .sr_get_all_records()
        .await?
        .into_iter()
        .map(|(_, sr)| sr)
        .filter(|sr| !NON_DISK_SR_TYPES.contains(&sr.sr_type.as_str()))
        .collect();
    srs.sort_by(|a, b| a.name_label.cmp(&b.name_label));
    Ok(srs)
}

pub async fn list_networks(api: &dyn XenApi) -> Result<Vec<NetworkRecord>> {
    let mut networks: Vec<NetworkRecord> = api
        .network_get_all_records()
        .await?
        .into_iter()
        .map(|(_, n)| n)
        .collect();
    networks.sort_by(|a, b| a.name_label.cmp(&b.name_label));
    Ok(networks)
}
