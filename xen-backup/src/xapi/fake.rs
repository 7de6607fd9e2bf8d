//! In-memory hypervisor and HTTP data-plane for tests.
//!
//! Disk contents are small byte vectors. Exports relative to a base image
//! produce a block delta; importing a delta patches the target in place, so
//! full ⊕ diff can be checked end to end.

use super::*;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::Router;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) const SESSION: &str = "OpaqueRef:fake-session";
const BLOCK: usize = 4;

#[derive(Debug, Clone)]
pub(crate) struct FakeTask {
    pub status: TaskStatus,
    pub progress: f64,
}

/// One data-plane request as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DataPlaneHit {
    pub path: &'static str,
    pub vdi: OpaqueRef,
    pub base: Option<OpaqueRef>,
}

#[derive(Default)]
pub(crate) struct FakeState {
    next_id: u64,
    pub vms: HashMap<OpaqueRef, VmRecord>,
    pub vbds: HashMap<OpaqueRef, VbdRecord>,
    pub vdis: HashMap<OpaqueRef, VdiRecord>,
    pub disk_data: HashMap<OpaqueRef, Vec<u8>>,
    pub vifs: HashMap<OpaqueRef, VifRecord>,
    pub networks: HashMap<OpaqueRef, NetworkRecord>,
    pub hosts: HashMap<OpaqueRef, HostRecord>,
    pub pifs: HashMap<OpaqueRef, PifRecord>,
    pub srs: HashMap<OpaqueRef, SrRecord>,
    pub tasks: HashMap<OpaqueRef, FakeTask>,
    /// Methods answering with an error
    pub failing: HashSet<String>,
    /// Mutating calls, in order
    pub journal: Vec<String>,
    pub hits: Vec<DataPlaneHit>,
    /// When set, the data-plane leaves tasks pending at this progress
    pub stall_tasks_at: Option<f64>,
}

impl FakeState {
    fn mint(&mut self, kind: &str) -> (OpaqueRef, String) {
        self.next_id += 1;
        (
            OpaqueRef(format!("OpaqueRef:{}-{}", kind, self.next_id)),
            format!("{}-uuid-{}", kind, self.next_id),
        )
    }

    fn finish_task(&mut self, task: &OpaqueRef) {
        let stall = self.stall_tasks_at;
        if let Some(t) = self.tasks.get_mut(task) {
            match stall {
                Some(progress) => t.progress = progress,
                None => {
                    t.status = TaskStatus::Success;
                    t.progress = 1.0;
                }
            }
        }
    }

    fn disk_ref(&self, vm: &OpaqueRef, userdevice: &str) -> Option<OpaqueRef> {
        self.vms.get(vm)?.vbds.iter().find_map(|vbd| {
            let record = self.vbds.get(vbd)?;
            (record.userdevice == userdevice && !record.vdi.is_null()).then(|| record.vdi.clone())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) enum Image {
    Full(Vec<u8>),
    Delta {
        len: usize,
        blocks: Vec<(usize, Vec<u8>)>,
    },
}

impl Image {
    pub fn decode(bytes: &[u8]) -> Image {
        serde_json::from_slice(bytes).expect("fake image")
    }

    fn delta(base: &[u8], current: &[u8]) -> Image {
        let blocks = current
            .chunks(BLOCK)
            .enumerate()
            .filter(|(i, chunk)| base.get(i * BLOCK..i * BLOCK + chunk.len()) != Some(*chunk))
            .map(|(i, chunk)| (i * BLOCK, chunk.to_vec()))
            .collect();
        Image::Delta {
            len: current.len(),
            blocks,
        }
    }

    fn apply(self, target: &mut Vec<u8>) {
        match self {
            Image::Full(data) => *target = data,
            Image::Delta { len, blocks } => {
                target.resize(len, 0);
                for (offset, block) in blocks {
                    target[offset..offset + block.len()].copy_from_slice(&block);
                }
            }
        }
    }
}

fn rejected(method: &str, code: &str, detail: impl ToString) -> XapiError {
    XapiError::Rpc {
        method: method.to_string(),
        code: code.to_string(),
        details: vec![detail.to_string()],
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeXen {
    state: Arc<Mutex<FakeState>>,
}

impl FakeXen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    fn check(&self, method: &str) -> XapiResult<MutexGuard<'_, FakeState>> {
        let state = self.state();
        if state.failing.contains(method) {
            return Err(rejected(method, "INTERNAL_ERROR", "injected failure"));
        }
        Ok(state)
    }

    /// Make every later call to `method` fail.
    pub fn fail(&self, method: &str) {
        self.state().failing.insert(method.to_string());
    }

    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    pub fn add_host(&self, ips: &[(&str, bool)]) -> OpaqueRef {
        let mut s = self.state();
        let (host_ref, host_uuid) = s.mint("host");
        let mut host = HostRecord {
            uuid: host_uuid,
            name_label: "xen01".to_string(),
            hostname: "xen01".to_string(),
            address: ips.first().map(|(ip, _)| ip.to_string()).unwrap_or_default(),
            pifs: Vec::new(),
        };
        for (i, (ip, attached)) in ips.iter().enumerate() {
            let (pif_ref, pif_uuid) = s.mint("pif");
            s.pifs.insert(
                pif_ref.clone(),
                PifRecord {
                    uuid: pif_uuid,
                    device: format!("eth{}", i),
                    ip: ip.to_string(),
                    currently_attached: *attached,
                    ..Default::default()
                },
            );
            host.pifs.push(pif_ref);
        }
        s.hosts.insert(host_ref.clone(), host);
        host_ref
    }

    pub fn add_sr(&self, name: &str, sr_type: &str) -> String {
        let mut s = self.state();
        let (sr_ref, sr_uuid) = s.mint("sr");
        s.srs.insert(
            sr_ref,
            SrRecord {
                uuid: sr_uuid.clone(),
                name_label: name.to_string(),
                sr_type: sr_type.to_string(),
                physical_size: 1 << 40,
                ..Default::default()
            },
        );
        sr_uuid
    }

    pub fn add_network(&self, name: &str) -> String {
        let mut s = self.state();
        let (net_ref, net_uuid) = s.mint("network");
        s.networks.insert(
            net_ref,
            NetworkRecord {
                uuid: net_uuid.clone(),
                name_label: name.to_string(),
                mtu: 1500,
                bridge: "xenbr0".to_string(),
                ..Default::default()
            },
        );
        net_uuid
    }

    /// Add a running VM with one disk per `(userdevice, virtual_size, data)`.
    pub fn add_vm(
        &self,
        name: &str,
        host: &OpaqueRef,
        disks: &[(&str, i64, &[u8])],
    ) -> (OpaqueRef, String) {
        let mut s = self.state();
        let (vm_ref, vm_uuid) = s.mint("vm");
        let mut record = VmRecord {
            uuid: vm_uuid.clone(),
            name_label: name.to_string(),
            name_description: format!("{} description", name),
            power_state: "Running".to_string(),
            memory_static_max: 2 << 30,
            memory_dynamic_max: 2 << 30,
            memory_dynamic_min: 1 << 30,
            memory_static_min: 1 << 30,
            vcpus_max: 2,
            vcpus_at_startup: 2,
            hvm_boot_policy: "BIOS order".to_string(),
            hvm_shadow_multiplier: 1.0,
            affinity: host.clone(),
            resident_on: host.clone(),
            ..Default::default()
        };
        record.platform.insert("acpi".to_string(), "1".to_string());
        record.hvm_boot_params.insert("order".to_string(), "dc".to_string());

        let sr = s.srs.keys().next().cloned().unwrap_or_default();
        for (slot, size, data) in disks {
            let (vdi_ref, vdi_uuid) = s.mint("vdi");
            s.vdis.insert(
                vdi_ref.clone(),
                VdiRecord {
                    uuid: vdi_uuid,
                    name_label: format!("{} disk {}", name, slot),
                    sr: sr.clone(),
                    virtual_size: *size,
                    physical_utilisation: data.len() as i64,
                    vdi_type: "system".to_string(),
                    ..Default::default()
                },
            );
            s.disk_data.insert(vdi_ref.clone(), data.to_vec());

            let (vbd_ref, vbd_uuid) = s.mint("vbd");
            s.vbds.insert(
                vbd_ref.clone(),
                VbdRecord {
                    uuid: vbd_uuid,
                    vm: vm_ref.clone(),
                    vdi: vdi_ref,
                    device: format!("xvd{}", slot),
                    userdevice: slot.to_string(),
                    bootable: *slot == "0",
                    mode: "RW".to_string(),
                    vbd_type: "Disk".to_string(),
                    empty: false,
                },
            );
            record.vbds.push(vbd_ref);
        }

        s.vms.insert(vm_ref.clone(), record);
        (vm_ref, vm_uuid)
    }

    pub fn add_cd_drive(&self, vm: &OpaqueRef, userdevice: &str) {
        let mut s = self.state();
        let (vbd_ref, vbd_uuid) = s.mint("vbd");
        s.vbds.insert(
            vbd_ref.clone(),
            VbdRecord {
                uuid: vbd_uuid,
                vm: vm.clone(),
                vdi: OpaqueRef::default(),
                device: "hdd".to_string(),
                userdevice: userdevice.to_string(),
                mode: "RO".to_string(),
                vbd_type: "CD".to_string(),
                empty: true,
                ..Default::default()
            },
        );
        if let Some(record) = s.vms.get_mut(vm) {
            record.vbds.push(vbd_ref);
        }
    }

    pub fn add_vif(&self, vm: &OpaqueRef, network_uuid: &str, device: &str, mac: &str) {
        let mut s = self.state();
        let network = s
            .networks
            .iter()
            .find(|(_, n)| n.uuid == network_uuid)
            .map(|(r, _)| r.clone())
            .unwrap_or_default();
        let (vif_ref, vif_uuid) = s.mint("vif");
        s.vifs.insert(
            vif_ref.clone(),
            VifRecord {
                uuid: vif_uuid,
                device: device.to_string(),
                mac: mac.to_string(),
                mtu: 1500,
                network,
                vm: vm.clone(),
            },
        );
        if let Some(record) = s.vms.get_mut(vm) {
            record.vifs.push(vif_ref);
        }
    }

    /// Overwrite bytes of the disk in `userdevice`, growing it if needed.
    pub fn write_disk(&self, vm: &OpaqueRef, userdevice: &str, offset: usize, bytes: &[u8]) {
        let mut s = self.state();
        let vdi = s.disk_ref(vm, userdevice).expect("disk in slot");
        let data = s.disk_data.entry(vdi).or_default();
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn vdi_in_slot(&self, vm: &OpaqueRef, userdevice: &str) -> Option<OpaqueRef> {
        self.state().disk_ref(vm, userdevice)
    }

    pub fn disk_data(&self, vm: &OpaqueRef, userdevice: &str) -> Option<Vec<u8>> {
        let s = self.state();
        let vdi = s.disk_ref(vm, userdevice)?;
        s.disk_data.get(&vdi).cloned()
    }

    pub fn vm_by_uuid(&self, uuid: &str) -> Option<OpaqueRef> {
        self.state()
            .vms
            .iter()
            .find(|(_, v)| v.uuid == uuid)
            .map(|(r, _)| r.clone())
    }

    pub fn set_task(&self, task: &OpaqueRef, status: TaskStatus, progress: f64) {
        if let Some(t) = self.state().tasks.get_mut(task) {
            t.status = status;
            t.progress = progress;
        }
    }

    /// Serve the data-plane on an ephemeral port; returns its base URL.
    pub async fn serve_data_plane(&self) -> String {
        let app = Router::new()
            .route("/export_raw_vdi", get(export_raw_vdi))
            .route("/import_raw_vdi", put(import_raw_vdi))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind data-plane");
        let addr = listener.local_addr().expect("data-plane address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        format!("http://{}", addr)
    }
}

#[derive(Debug, Deserialize)]
struct DataPlaneQuery {
    session_id: String,
    task_id: String,
    vdi: String,
    format: String,
    base: Option<String>,
}

fn check_query(q: &DataPlaneQuery) -> Result<(), (StatusCode, String)> {
    if q.session_id != SESSION {
        return Err((StatusCode::UNAUTHORIZED, "bad session".to_string()));
    }
    if q.format != "vhd" {
        return Err((StatusCode::BAD_REQUEST, format!("bad format {}", q.format)));
    }
    Ok(())
}

async fn export_raw_vdi(
    State(fake): State<FakeXen>,
    Query(q): Query<DataPlaneQuery>,
) -> Result<Vec<u8>, (StatusCode, String)> {
    check_query(&q)?;
    let mut s = fake.state();
    let vdi = OpaqueRef(q.vdi.clone());
    let base = q.base.clone().map(OpaqueRef);

    let current = s
        .disk_data
        .get(&vdi)
        .cloned()
        .ok_or((StatusCode::NOT_FOUND, format!("no vdi {}", q.vdi)))?;
    let image = match &base {
        Some(b) => {
            let base_data = s
                .disk_data
                .get(b)
                .ok_or((StatusCode::NOT_FOUND, format!("no base {}", b)))?;
            Image::delta(base_data, &current)
        }
        None => Image::Full(current),
    };

    s.hits.push(DataPlaneHit {
        path: "export_raw_vdi",
        vdi,
        base,
    });
    s.finish_task(&OpaqueRef(q.task_id.clone()));

    serde_json::to_vec(&image).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn import_raw_vdi(
    State(fake): State<FakeXen>,
    Query(q): Query<DataPlaneQuery>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    check_query(&q)?;
    let image: Image = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut s = fake.state();
    let vdi = OpaqueRef(q.vdi.clone());
    if !s.vdis.contains_key(&vdi) {
        return Err((StatusCode::NOT_FOUND, format!("no vdi {}", q.vdi)));
    }

    image.apply(s.disk_data.entry(vdi.clone()).or_default());
    s.hits.push(DataPlaneHit {
        path: "import_raw_vdi",
        vdi,
        base: None,
    });
    s.finish_task(&OpaqueRef(q.task_id.clone()));

    Ok(StatusCode::OK)
}

#[async_trait]
impl XenApi for FakeXen {
    fn session_id(&self) -> &str {
        SESSION
    }

    async fn logout(&self) -> XapiResult<()> {
        self.check("session.logout")?;
        Ok(())
    }

    async fn vm_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        let s = self.check("VM.get_by_uuid")?;
        s.vms
            .iter()
            .find(|(_, v)| v.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| rejected("VM.get_by_uuid", "UUID_INVALID", uuid))
    }

    async fn vm_get_record(&self, vm: &OpaqueRef) -> XapiResult<VmRecord> {
        let s = self.check("VM.get_record")?;
        s.vms
            .get(vm)
            .cloned()
            .ok_or_else(|| rejected("VM.get_record", "HANDLE_INVALID", vm))
    }

    async fn vm_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, VmRecord)>> {
        let s = self.check("VM.get_all_records")?;
        let mut all: Vec<_> = s.vms.iter().map(|(r, v)| (r.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    async fn vm_snapshot(&self, vm: &OpaqueRef, new_name: &str) -> XapiResult<OpaqueRef> {
        let mut s = self.check("VM.snapshot")?;
        let source = s
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| rejected("VM.snapshot", "HANDLE_INVALID", vm))?;

        let (snap_ref, snap_uuid) = s.mint("vm");
        let mut snap = source.clone();
        snap.uuid = snap_uuid;
        snap.name_label = new_name.to_string();
        snap.is_a_snapshot = true;
        snap.power_state = "Halted".to_string();
        snap.vbds = Vec::new();
        snap.vifs = Vec::new();

        for vbd_ref in &source.vbds {
            let Some(vbd) = s.vbds.get(vbd_ref).cloned() else {
                continue;
            };
            let (new_vbd_ref, new_vbd_uuid) = s.mint("vbd");
            let mut new_vbd = vbd.clone();
            new_vbd.uuid = new_vbd_uuid;
            new_vbd.vm = snap_ref.clone();

            if !vbd.vdi.is_null() {
                let vdi = s.vdis.get(&vbd.vdi).cloned().unwrap_or_default();
                let data = s.disk_data.get(&vbd.vdi).cloned().unwrap_or_default();
                let (new_vdi_ref, new_vdi_uuid) = s.mint("vdi");
                let mut new_vdi = vdi;
                new_vdi.uuid = new_vdi_uuid;
                s.vdis.insert(new_vdi_ref.clone(), new_vdi);
                s.disk_data.insert(new_vdi_ref.clone(), data);
                new_vbd.vdi = new_vdi_ref;
            }

            s.vbds.insert(new_vbd_ref.clone(), new_vbd);
            snap.vbds.push(new_vbd_ref);
        }

        for vif_ref in &source.vifs {
            let Some(vif) = s.vifs.get(vif_ref).cloned() else {
                continue;
            };
            let (new_vif_ref, new_vif_uuid) = s.mint("vif");
            let mut new_vif = vif;
            new_vif.uuid = new_vif_uuid;
            new_vif.vm = snap_ref.clone();
            s.vifs.insert(new_vif_ref.clone(), new_vif);
            snap.vifs.push(new_vif_ref);
        }

        s.vms.insert(snap_ref.clone(), snap);
        s.journal.push(format!("VM.snapshot {}", snap_ref));
        Ok(snap_ref)
    }

    async fn vm_create(&self, spec: &NewVm) -> XapiResult<OpaqueRef> {
        let mut s = self.check("VM.create")?;
        let (vm_ref, vm_uuid) = s.mint("vm");
        let record = VmRecord {
            uuid: vm_uuid,
            name_label: spec.name_label.clone(),
            name_description: spec.name_description.clone(),
            power_state: "Halted".to_string(),
            memory_static_max: spec.memory_static_max,
            memory_dynamic_max: spec.memory_dynamic_max,
            memory_dynamic_min: spec.memory_dynamic_min,
            memory_static_min: spec.memory_static_min,
            vcpus_params: spec.vcpus_params.clone(),
            vcpus_max: spec.vcpus_max,
            vcpus_at_startup: spec.vcpus_at_startup,
            hvm_boot_policy: spec.hvm_boot_policy.clone(),
            hvm_boot_params: spec.hvm_boot_params.clone(),
            platform: spec.platform.clone(),
            other_config: spec.other_config.clone(),
            ..Default::default()
        };
        s.vms.insert(vm_ref.clone(), record);
        s.journal.push(format!("VM.create {}", vm_ref));
        Ok(vm_ref)
    }

    async fn vm_destroy(&self, vm: &OpaqueRef) -> XapiResult<()> {
        let mut s = self.check("VM.destroy")?;
        let record = s
            .vms
            .remove(vm)
            .ok_or_else(|| rejected("VM.destroy", "HANDLE_INVALID", vm))?;
        for vbd in &record.vbds {
            s.vbds.remove(vbd);
        }
        for vif in &record.vifs {
            s.vifs.remove(vif);
        }
        s.journal.push(format!("VM.destroy {}", vm));
        Ok(())
    }

    async fn vbd_get_record(&self, vbd: &OpaqueRef) -> XapiResult<VbdRecord> {
        let s = self.check("VBD.get_record")?;
        s.vbds
            .get(vbd)
            .cloned()
            .ok_or_else(|| rejected("VBD.get_record", "HANDLE_INVALID", vbd))
    }

    async fn vbd_create(&self, spec: &NewVbd) -> XapiResult<OpaqueRef> {
        let mut s = self.check("VBD.create")?;
        if !s.vms.contains_key(&spec.vm) {
            return Err(rejected("VBD.create", "HANDLE_INVALID", &spec.vm));
        }
        if !s.vdis.contains_key(&spec.vdi) {
            return Err(rejected("VBD.create", "HANDLE_INVALID", &spec.vdi));
        }
        let (vbd_ref, vbd_uuid) = s.mint("vbd");
        s.vbds.insert(
            vbd_ref.clone(),
            VbdRecord {
                uuid: vbd_uuid,
                vm: spec.vm.clone(),
                vdi: spec.vdi.clone(),
                device: spec.device.clone(),
                userdevice: spec.userdevice.clone(),
                bootable: spec.bootable,
                mode: "RW".to_string(),
                vbd_type: "Disk".to_string(),
                empty: false,
            },
        );
        if let Some(vm) = s.vms.get_mut(&spec.vm) {
            vm.vbds.push(vbd_ref.clone());
        }
        s.journal.push(format!("VBD.create {}", vbd_ref));
        Ok(vbd_ref)
    }

    async fn vbd_destroy(&self, vbd: &OpaqueRef) -> XapiResult<()> {
        let mut s = self.check("VBD.destroy")?;
        let record = s
            .vbds
            .remove(vbd)
            .ok_or_else(|| rejected("VBD.destroy", "HANDLE_INVALID", vbd))?;
        if let Some(vm) = s.vms.get_mut(&record.vm) {
            vm.vbds.retain(|r| r != vbd);
        }
        s.journal.push(format!("VBD.destroy {}", vbd));
        Ok(())
    }

    async fn vdi_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        let s = self.check("VDI.get_by_uuid")?;
        s.vdis
            .iter()
            .find(|(_, v)| v.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| rejected("VDI.get_by_uuid", "UUID_INVALID", uuid))
    }

    async fn vdi_get_record(&self, vdi: &OpaqueRef) -> XapiResult<VdiRecord> {
        let s = self.check("VDI.get_record")?;
        s.vdis
            .get(vdi)
            .cloned()
            .ok_or_else(|| rejected("VDI.get_record", "HANDLE_INVALID", vdi))
    }

    async fn vdi_create(&self, spec: &NewVdi) -> XapiResult<OpaqueRef> {
        let mut s = self.check("VDI.create")?;
        if !s.srs.contains_key(&spec.sr) {
            return Err(rejected("VDI.create", "HANDLE_INVALID", &spec.sr));
        }
        let (vdi_ref, vdi_uuid) = s.mint("vdi");
        s.vdis.insert(
            vdi_ref.clone(),
            VdiRecord {
                uuid: vdi_uuid,
                name_label: spec.name_label.clone(),
                name_description: spec.name_description.clone(),
                sr: spec.sr.clone(),
                virtual_size: spec.virtual_size,
                physical_utilisation: 0,
                vdi_type: spec.vdi_type.clone(),
                sharable: spec.sharable,
                read_only: spec.read_only,
            },
        );
        s.disk_data.insert(vdi_ref.clone(), Vec::new());
        s.journal.push(format!("VDI.create {}", vdi_ref));
        Ok(vdi_ref)
    }

    async fn vdi_destroy(&self, vdi: &OpaqueRef) -> XapiResult<()> {
        let mut s = self.check("VDI.destroy")?;
        s.vdis
            .remove(vdi)
            .ok_or_else(|| rejected("VDI.destroy", "HANDLE_INVALID", vdi))?;
        s.disk_data.remove(vdi);
        s.journal.push(format!("VDI.destroy {}", vdi));
        Ok(())
    }

    async fn vif_get_record(&self, vif: &OpaqueRef) -> XapiResult<VifRecord> {
        let s = self.check("VIF.get_record")?;
        s.vifs
            .get(vif)
            .cloned()
            .ok_or_else(|| rejected("VIF.get_record", "HANDLE_INVALID", vif))
    }

    async fn vif_create(&self, spec: &NewVif) -> XapiResult<OpaqueRef> {
        let mut s = self.check("VIF.create")?;
        let (vif_ref, vif_uuid) = s.mint("vif");
        s.vifs.insert(
            vif_ref.clone(),
            VifRecord {
                uuid: vif_uuid,
                device: spec.device.clone(),
                mac: spec.mac.clone(),
                mtu: spec.mtu,
                network: spec.network.clone(),
                vm: spec.vm.clone(),
            },
        );
        if let Some(vm) = s.vms.get_mut(&spec.vm) {
            vm.vifs.push(vif_ref.clone());
        }
        s.journal.push(format!("VIF.create {}", vif_ref));
        Ok(vif_ref)
    }

    async fn network_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        let s = self.check("network.get_by_uuid")?;
        s.networks
            .iter()
            .find(|(_, n)| n.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| rejected("network.get_by_uuid", "UUID_INVALID", uuid))
    }

    async fn network_get_record(&self, network: &OpaqueRef) -> XapiResult<NetworkRecord> {
        let s = self.check("network.get_record")?;
        s.networks
            .get(network)
            .cloned()
            .ok_or_else(|| rejected("network.get_record", "HANDLE_INVALID", network))
    }

    async fn network_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, NetworkRecord)>> {
        let s = self.check("network.get_all_records")?;
        let mut all: Vec<_> = s.networks.iter().map(|(r, n)| (r.clone(), n.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    async fn host_get_record(&self, host: &OpaqueRef) -> XapiResult<HostRecord> {
        let s = self.check("host.get_record")?;
        s.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| rejected("host.get_record", "HANDLE_INVALID", host))
    }

    async fn pif_get_record(&self, pif: &OpaqueRef) -> XapiResult<PifRecord> {
        let s = self.check("PIF.get_record")?;
        s.pifs
            .get(pif)
            .cloned()
            .ok_or_else(|| rejected("PIF.get_record", "HANDLE_INVALID", pif))
    }

    async fn sr_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        let s = self.check("SR.get_by_uuid")?;
        s.srs
            .iter()
            .find(|(_, sr)| sr.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| rejected("SR.get_by_uuid", "UUID_INVALID", uuid))
    }

    async fn sr_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, SrRecord)>> {
        let s = self.check("SR.get_all_records")?;
        let mut all: Vec<_> = s.srs.iter().map(|(r, sr)| (r.clone(), sr.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    async fn task_create(&self, label: &str, _description: &str) -> XapiResult<OpaqueRef> {
        let mut s = self.check("task.create")?;
        let (task_ref, _) = s.mint("task");
        s.tasks.insert(
            task_ref.clone(),
            FakeTask {
                status: TaskStatus::Pending,
                progress: 0.0,
            },
        );
        s.journal.push(format!("task.create {}", label));
        Ok(task_ref)
    }

    async fn task_get_status(&self, task: &OpaqueRef) -> XapiResult<TaskStatus> {
        let s = self.check("task.get_status")?;
        s.tasks
            .get(task)
            .map(|t| t.status)
            .ok_or_else(|| rejected("task.get_status", "HANDLE_INVALID", task))
    }

    async fn task_get_progress(&self, task: &OpaqueRef) -> XapiResult<f64> {
        let s = self.check("task.get_progress")?;
        s.tasks
            .get(task)
            .map(|t| t.progress)
            .ok_or_else(|| rejected("task.get_progress", "HANDLE_INVALID", task))
    }

    async fn task_destroy(&self, task: &OpaqueRef) -> XapiResult<()> {
        let mut s = self.check("task.destroy")?;
        s.tasks.remove(task);
        Ok(())
    }
}
