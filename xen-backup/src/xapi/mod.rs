//! Management API seam.
//!
//! The engine talks to the pool through the [`XenApi`] trait: typed object
//! records, create/destroy calls, snapshots and asynchronous tasks. The
//! production implementation is [`JsonRpcSession`]; tests use an in-memory
//! hypervisor.

pub mod jsonrpc;
pub mod records;

#[cfg(test)]
pub(crate) mod fake;

pub use jsonrpc::JsonRpcSession;
pub use records::{
    HostRecord, NetworkRecord, NewVbd, NewVdi, NewVif, NewVm, PifRecord, SrRecord, VbdRecord,
    VdiRecord, VifRecord, VmRecord,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reference to a server-side object.
///
/// References are capability tokens for the current call sequence. They are
/// regenerated whenever the object is cloned or snapshotted, so stable
/// identity lives in uuids and disk slots instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueRef(pub String);

impl OpaqueRef {
    pub const NULL: &'static str = "OpaqueRef:NULL";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == Self::NULL
    }
}

impl fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpaqueRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum XapiError {
    #[error("{method} failed: {code} {details:?}")]
    Rpc {
        method: String,
        code: String,
        details: Vec<String>,
    },

    #[error("{method}: transport failure: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method}: unexpected response: {reason}")]
    Decode { method: String, reason: String },
}

pub type XapiResult<T> = std::result::Result<T, XapiError>;

/// Lifecycle state of an asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed surface of the management API used by the engine.
///
/// Every call is a fallible remote operation; none of them touch local state.
#[async_trait]
pub trait XenApi: Send + Sync {
    /// Session token embedded in data-plane URLs.
    fn session_id(&self) -> &str;

    async fn logout(&self) -> XapiResult<()>;

    async fn vm_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef>;
    async fn vm_get_record(&self, vm: &OpaqueRef) -> XapiResult<VmRecord>;
    async fn vm_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, VmRecord)>>;
    async fn vm_snapshot(&self, vm: &OpaqueRef, new_name: &str) -> XapiResult<OpaqueRef>;
    async fn vm_create(&self, spec: &NewVm) -> XapiResult<OpaqueRef>;
    async fn vm_destroy(&self, vm: &OpaqueRef) -> XapiResult<()>;

    async fn vbd_get_record(&self, vbd: &OpaqueRef) -> XapiResult<VbdRecord>;
    async fn vbd_create(&self, spec: &NewVbd) -> XapiResult<OpaqueRef>;
    async fn vbd_destroy(&self, vbd: &OpaqueRef) -> XapiResult<()>;

    async fn vdi_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef>;
    async fn vdi_get_record(&self, vdi: &OpaqueRef) -> XapiResult<VdiRecord>;
    async fn vdi_create(&self, spec: &NewVdi) -> XapiResult<OpaqueRef>;
    async fn vdi_destroy(&self, vdi: &OpaqueRef) -> XapiResult<()>;

    async fn vif_get_record(&self, vif: &OpaqueRef) -> XapiResult<VifRecord>;
    async fn vif_create(&self, spec: &NewVif) -> XapiResult<OpaqueRef>;

    async fn network_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef>;
    async fn network_get_record(&self, network: &OpaqueRef) -> XapiResult<NetworkRecord>;
    async fn network_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, NetworkRecord)>>;

    async fn host_get_record(&self, host: &OpaqueRef) -> XapiResult<HostRecord>;
    async fn pif_get_record(&self, pif: &OpaqueRef) -> XapiResult<PifRecord>;

    async fn sr_get_by_uuid(&self, uuid: &str) -> XapiResult<OpaqueRef>;
    async fn sr_get_all_records(&self) -> XapiResult<Vec<(OpaqueRef, SrRecord)>>;

    async fn task_create(&self, label: &str, description: &str) -> XapiResult<OpaqueRef>;
    async fn task_get_status(&self, task: &OpaqueRef) -> XapiResult<TaskStatus>;
    async fn task_get_progress(&self, task: &OpaqueRef) -> XapiResult<f64>;
    async fn task_destroy(&self, task: &OpaqueRef) -> XapiResult<()>;
}

/// Turn a configured host or address into a base URL.
///
/// Bare addresses (`172.16.2.163`, `xen01:8080`) get `default_scheme`;
/// trailing slashes are dropped.
pub fn normalize_host(addr: &str, default_scheme: &str) -> String {
    let trimmed = addr.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", default_scheme, trimmed)
    }
}
