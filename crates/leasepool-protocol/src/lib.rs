//! Wire types for leasepool.
//!
//! This crate defines the JSON shapes shared between the leasepool server,
//! its on-disk catalog files, and any client driving the REST surface.
//!
//! Every operation answers with an [`OpResult`]: `rc == 0` is success, any
//! other value is a failure with a human-readable `msg` and a stable `code`.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result code for a successful operation.
pub const RC_OK: i32 = 0;

/// Result code for a failed operation.
pub const RC_FAILED: i32 = -1;

/// Sentinel lessor recorded on devices nobody holds.
pub const UNLEASED: &str = "unleased";

/// Placeholder written over credential fields for non-lessees.
pub const REDACTED: &str = ".";

// ============================================================================
// Operation results
// ============================================================================

/// Uniform result of every orchestration operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    /// Zero on success.
    pub rc: i32,
    /// Human-readable outcome.
    pub msg: String,
    /// Machine-readable failure category (absent on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Operation-specific extra fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OpResult {
    /// Successful result with a message.
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            rc: RC_OK,
            msg: msg.into(),
            code: None,
            fields: Map::new(),
        }
    }

    /// Failed result with a message and category code.
    pub fn failed(msg: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            rc: RC_FAILED,
            msg: msg.into(),
            code: Some(code.into()),
            fields: Map::new(),
        }
    }

    /// Attach an extra field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Whether `rc` signals success.
    pub fn is_ok(&self) -> bool {
        self.rc == RC_OK
    }

    /// Look up an extra field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

// ============================================================================
// Catalog records
// ============================================================================

/// Whether a device is bare metal or a hypervisor-managed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Physical machine; no lifecycle operations.
    #[default]
    Physical,
    /// Virtual machine controlled by a hypervisor backend.
    Virtual,
}

/// One entry of the device catalog (`devices.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique device name.
    pub name: String,
    /// Physical or virtual.
    #[serde(default)]
    pub machinetype: MachineType,
    /// Operating system label.
    #[serde(default)]
    pub os: String,
    /// Comma-separated list of installed contents.
    #[serde(default)]
    pub contents: String,
    /// Word size label ("32" or "64").
    #[serde(default)]
    pub bits: String,
    /// Distribution label.
    #[serde(default)]
    pub distro: String,
    /// Name of the hypervisor binding controlling this VM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,
    /// Administrative owner, distinct from the lessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Identities allowed to lease this device; empty means anyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permittedusers: Vec<String>,
    /// Compute flavor used when a cloud backend boots this VM.
    #[serde(
        default,
        rename = "openstack-flavor",
        skip_serializing_if = "Option::is_none"
    )]
    pub flavor: Option<String>,
    /// Host name.
    #[serde(default)]
    pub hostname: String,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Administrator login.
    #[serde(default)]
    pub adminname: String,
    /// Administrator password.
    #[serde(default)]
    pub adminpswd: String,
}

impl Device {
    /// Whether this device is a VM.
    pub fn is_virtual(&self) -> bool {
        self.machinetype == MachineType::Virtual
    }

    /// Copy with all credential fields replaced by [`REDACTED`].
    pub fn redacted(&self) -> Self {
        Self {
            hostname: REDACTED.to_string(),
            username: REDACTED.to_string(),
            password: REDACTED.to_string(),
            adminname: REDACTED.to_string(),
            adminpswd: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

/// A known identity (`users.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity name.
    pub name: String,
    /// Notification address.
    #[serde(default)]
    pub email: String,
    /// Personal token for the internal launch service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlaunchtoken: Option<String>,
}

/// Device joined with its lease state, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    /// The catalog record, possibly redacted.
    #[serde(flatten)]
    pub device: Device,
    /// "true" when nobody holds the device.
    pub available: String,
    /// Current lessor or [`UNLEASED`].
    pub lessor: String,
}

// ============================================================================
// Requests
// ============================================================================

/// Lease a device by exact name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseByNameRequest {
    /// Device name.
    pub name: String,
    /// Requesting identity.
    pub lessor: String,
}

/// Lease the first available device running an OS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseByOsRequest {
    /// Operating system label.
    pub os: String,
    /// Requesting identity.
    pub lessor: String,
}

/// Lease the first available device matching contents, OS and word size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseByContentsRequest {
    /// Comma-separated contents the device must include.
    #[serde(default)]
    pub contents: String,
    /// Operating system label.
    pub os: String,
    /// Word size label.
    pub bits: String,
    /// Requesting identity.
    pub lessor: String,
}

/// An action on one device by one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceActionRequest {
    /// Device name.
    pub name: String,
    /// Acting identity.
    pub actor: String,
}

/// Rename the bound snapshot of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameSnapshotRequest {
    /// Device name.
    pub name: String,
    /// Acting identity.
    pub actor: String,
    /// New snapshot name; defaults to a timestamped archive name.
    #[serde(default)]
    pub new_name: Option<String>,
}

/// Change which snapshot a device restores to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindSnapshotRequest {
    /// Device name.
    pub name: String,
    /// Acting identity.
    pub actor: String,
    /// Snapshot designator.
    pub snapshot: String,
}

/// Add a device to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDeviceRequest {
    /// Acting identity.
    pub actor: String,
    /// The new record.
    pub device: Device,
}
