//! Management API client over the pool master's JSON-RPC endpoint.

use super::{
    normalize_host, HostRecord, NetworkRecord, NewVbd, NewVdi, NewVif, NewVm, OpaqueRef, PifRecord,
    SrRecord, TaskStatus, VbdRecord, VdiRecord, VifRecord, VmRecord, XapiError, XapiResult, XenApi,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const JSONRPC_PATH: &str = "/jsonrpc";
const API_VERSION: &str = "1.0";
const ORIGINATOR: &str = "xen-backup";

/// Logged-in session against a pool master.
pub struct JsonRpcSession {
    client: reqwest::Client,
    endpoint: String,
    session: String,
    next_id: AtomicU64,
}

impl JsonRpcSession {
    /// Log in with a username and password.
    ///
    /// Pools usually serve self-signed certificates; `insecure_tls` skips
    /// certificate verification.
    pub async fn login(
        host: &str,
        username: &str,
        password: &str,
        insecure_tls: bool,
    ) -> XapiResult<Self> {
        const METHOD: &str = "session.login_with_password";

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|source| XapiError::Transport {
                method: METHOD.to_string(),
                source,
            })?;
        let endpoint = format!("{}{}", normalize_host(host, "https"), JSONRPC_PATH);
        let next_id = AtomicU64::new(1);

        let result = raw_call(
            &client,
            &endpoint,
            next_id.fetch_add(1, Ordering::Relaxed),
            METHOD,
            vec![
                json!(username),
                json!(password),
                json!(API_VERSION),
                json!(ORIGINATOR),
            ],
        )
        .await?;
        let session: String = decode(METHOD, result)?;

        info!("Logged in to {} as {}", host, username);

        Ok(Self {
            client,
            endpoint,
            session,
            next_id,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> XapiResult<T> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(json!(self.session));
        params.extend(args);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("-> {} (id {})", method, id);

        let result = raw_call(&self.client, &self.endpoint, id, method, params).await?;
        decode(method, result)
    }

    async fn call_unit(&self, method: &str, args: Vec<Value>) -> XapiResult<()> {
        let _: Value = self.call(method, args).await?;
        Ok(())
    }

    async fn all_records<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> XapiResult<Vec<(OpaqueRef, T)>> {
        let map: HashMap<String, T> = self.call(method, Vec::new()).await?;
        let mut records: Vec<(OpaqueRef, T)> =
            map.into_iter().map(|(r, rec)| (OpaqueRef(r), rec)).collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

async fn raw_call(
    client: &reqwest::Client,
    endpoint: &str,
    id: u64,
    method: &str,
    params: Vec<Value>,
) -> XapiResult<Value> {
    let body = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    });

    let resp = client
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|source| XapiError::Transport {
            method: method.to_string(),
            source,
        })?;

    let status = resp.status();
    let mut envelope: Value = resp.json().await.map_err(|source| XapiError::Transport {
        method: method.to_string(),
        source,
    })?;

    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        return Err(rpc_error(method, error));
    }

    envelope
        .as_object_mut()
        .and_then(|m| m.remove("result"))
        .ok_or_else(|| XapiError::Decode {
            method: method.to_string(),
            reason: format!("HTTP {} response without result", status),
        })
}

fn rpc_error(method: &str, error: &Value) -> XapiError {
    let code = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| error.get("code").map(|c| c.to_string()))
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let details = error
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    XapiError::Rpc {
        method: method.to_string(),
        code,
        details,
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> XapiResult<T> {
    serde_json::from_value(value).map_err(|e| XapiError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn vm_create_record(spec: &NewVm) -> Value {
    json!({
        "name_label": spec.name_label,
        "name_description": spec.name_description,
        "user_version": spec.user_version,
        "is_a_template": false,
        "affinity": OpaqueRef::NULL,
        "memory_target": spec.memory_target,
        "memory_static_max": spec.memory_static_max,
        "memory_dynamic_max": spec.memory_dynamic_max,
        "memory_dynamic_min": spec.memory_dynamic_min,
        "memory_static_min": spec.memory_static_min,
        "VCPUs_params": spec.vcpus_params,
        "VCPUs_max": spec.vcpus_max,
        "VCPUs_at_startup": spec.vcpus_at_startup,
        "actions_after_shutdown": spec.actions_after_shutdown,
        "actions_after_reboot": spec.actions_after_reboot,
        "actions_after_crash": spec.actions_after_crash,
        "PV_bootloader": spec.pv_bootloader,
        "PV_kernel": spec.pv_kernel,
        "PV_ramdisk": spec.pv_ramdisk,
        "PV_args": spec.pv_args,
        "PV_bootloader_args": spec.pv_bootloader_args,
        "PV_legacy_args": spec.pv_legacy_args,
        "HVM_boot_policy": spec.hvm_boot_policy,
        "HVM_boot_params": spec.hvm_boot_params,
        "HVM_shadow_multiplier": spec.hvm_shadow_multiplier,
        "platform": spec.platform,
        "PCI_bus": "",
        "other_config": spec.other_config,
        "recommendations": "",
        "xenstore_data": {},
        "tags": [],
    })
}

#[async_trait]
impl XenApi for JsonRpcSession {
    fn session_id(&self) -> &str {
        &self.session
    }

    async fn logout(&self) -> XapiResult<()> {
        self.call_unit("session.logout", Vec::new()).await
    }

    async fn vm_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        self.call("VM.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn vm_get_record(&self, vm: &OpaqueRef) -> XapiResult<VmRecord> {
        self.call("VM.get_record", vec![json!(vm)]).await
    }

    async fn vm_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, VmRecord)>> {
        self.all_records("VM.get_all_records").await
    }

    async fn vm_snapshot(&self, vm: &OpaqueRef, new_name: &str) -> XapiResult<OpaqueRef> {
        self.call("VM.snapshot", vec![json!(vm), json!(new_name)]).await
    }

    async fn vm_create(&self, spec: &NewVm) -> XapiResult<OpaqueRef> {
        self.call("VM.create", vec![vm_create_record(spec)]).await
    }

    async fn vm_destroy(&self, vm: &OpaqueRef) -> XapiResult<()> {
        self.call_unit("VM.destroy", vec![json!(vm)]).await
    }

    async fn vbd_get_record(&self, vbd: &OpaqueRef) -> XapiResult<VbdRecord> {
        self.call("VBD.get_record", vec![json!(vbd)]).await
    }

    async fn vbd_create(&self, spec: &NewVbd) -> XapiResult<OpaqueRef> {
        let record = json!({
            "VM": spec.vm,
            "VDI": spec.vdi,
            "userdevice": spec.userdevice,
            "device": spec.device,
            "bootable": spec.bootable,
            "mode": "RW",
            "type": "Disk",
            "unpluggable": true,
            "empty": false,
            "other_config": {},
            "qos_algorithm_type": "",
            "qos_algorithm_params": {},
        });
        self.call("VBD.create", vec![record]).await
    }

    async fn vbd_destroy(&self, vbd: &OpaqueRef) -> XapiResult<()> {
        self.call_unit("VBD.destroy", vec![json!(vbd)]).await
    }

    async fn vdi_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        self.call("VDI.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn vdi_get_record(&self, vdi: &OpaqueRef) -> XapiResult<VdiRecord> {
        self.call("VDI.get_record", vec![json!(vdi)]).await
    }

    async fn vdi_create(&self, spec: &NewVdi) -> XapiResult<OpaqueRef> {
        let record = json!({
            "name_label": spec.name_label,
            "name_description": spec.name_description,
            "SR": spec.sr,
            "virtual_size": spec.virtual_size,
            "type": spec.vdi_type,
            "sharable": spec.sharable,
            "read_only": spec.read_only,
            "other_config": {},
            "xenstore_data": {},
            "sm_config": {},
            "tags": [],
        });
        self.call("VDI.create", vec![record]).await
    }

    async fn vdi_destroy(&self, vdi: &OpaqueRef) -> XapiResult<()> {
        self.call_unit("VDI.destroy", vec![json!(vdi)]).await
    }

    async fn vif_get_record(&self, vif: &OpaqueRef) -> XapiResult<VifRecord> {
        self.call("VIF.get_record", vec![json!(vif)]).await
    }

    async fn vif_create(&self, spec: &NewVif) -> XapiResult<OpaqueRef> {
        let record = json!({
            "device": spec.device,
            "network": spec.network,
            "VM": spec.vm,
            "MAC": spec.mac,
            "MTU": spec.mtu,
            "other_config": {},
            "qos_algorithm_type": "",
            "qos_algorithm_params": {},
        });
        self.call("VIF.create", vec![record]).await
    }

    async fn network_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        self.call("network.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn network_get_record(&self, network: &OpaqueRef) -> XapiResult<NetworkRecord> {
        self.call("network.get_record", vec![json!(network)]).await
    }

    async fn network_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, NetworkRecord)>> {
        self.all_records("network.get_all_records").await
    }

    async fn host_get_record(&self, host: &OpaqueRef) -> XapiResult<HostRecord> {
        self.call("host.get_record", vec![json!(host)]).await
    }

    async fn pif_get_record(&self, pif: &OpaqueRef) -> XapiResult<PifRecord> {
        self.call("PIF.get_record", vec![json!(pif)]).await
    }

    async fn sr_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef> {
        self.call("SR.get_by_uuid", vec![json!(uuid)]).await
    }

    async fn sr_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, SrRecord)>> {
        self.all_records("SR.get_all_records").await
    }

    async fn task_create(&self, label: &str, description: &str) -> XapiResult<OpaqueRef> {
        self.call("task.create", vec![json!(label), json!(description)])
            .await
    }

    async fn task_get_status(&self, task: &OpaqueRef) -> XapiResult<TaskStatus> {
        const METHOD: &str = "task.get_status";
        let status: String = self.call(METHOD, vec![json!(task)]).await?;
        TaskStatus::from_wire(&status).ok_or_else(|| XapiError::Decode {
            method: METHOD.to_string(),
            reason: format!("unknown task status {}", status),
        })
    }

    async fn task_get_progress(&self, task: &OpaqueRef) -> XapiResult<f64> {
        self.call("task.get_progress", vec![json!(task)]).await
    }

    async fn task_destroy(&self, task: &OpaqueRef) -> XapiResult<()> {
        self.call_unit("task.destroy", vec![json!(task)]).await
    }
}
