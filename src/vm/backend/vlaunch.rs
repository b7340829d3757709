//! vLaunch backend.
//!
//! The service addresses VMs by opaque id and runs every power or
//! snapshot action as a work request with its own status. It also drops
//! a second request against a VM that already has one open, so every
//! public operation here runs inside a per-VM [`ResourceSerializer`]
//! slot and refuses to start while any work request is still open.

use crate::config::{secret_from_env, VLaunchConfig};
use crate::error::{Error, Result};
use crate::poll::PollingWaiter;
use crate::sync::ResourceSerializer;
use crate::vm::backend::{resolve_host, VLaunchClient};
use crate::vm::{CanonicalState, HypervisorAdapter, VmContext};
use async_trait::async_trait;
use leasepool_protocol::OpResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Work-request status the service reports when it is done.
pub const REQUEST_COMPLETED: &str = "Completed";
/// Work-request status the service reports on failure.
pub const REQUEST_ERROR: &str = "ERROR";
/// Work-request status of a withdrawn request.
pub const REQUEST_CANCELED: &str = "Canceled";

const POWERED_ON: &str = "poweredOn";
const POWERED_OFF: &str = "poweredOff";

/// A VM as the service describes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Service-side id.
    pub id: i64,
    /// VM name.
    #[serde(default)]
    pub vmname: String,
    /// `poweredOn`, `poweredOff`, or `suspended`.
    #[serde(default)]
    pub power_state: String,
    /// Snapshots of this VM.
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
}

impl VmRecord {
    fn canonical_state(&self) -> CanonicalState {
        match self.power_state.as_str() {
            POWERED_ON => CanonicalState::Active,
            POWERED_OFF | "suspended" => CanonicalState::Paused,
            _ => CanonicalState::Unrecognized,
        }
    }
}

/// One snapshot of a [`VmRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Service-side id.
    pub id: i64,
    /// Snapshot name.
    pub name: String,
}

/// An asynchronous service operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Request id.
    pub id: i64,
    /// Current status.
    #[serde(default)]
    pub status: String,
}

/// Calls the launch service answers. Every call carries the caller's token.
#[async_trait]
pub trait LaunchService: Send + Sync + Debug {
    /// Every VM the token can see.
    async fn list_vms(&self, token: &str) -> Result<Vec<VmRecord>>;

    /// One VM, or `None` when the id is unknown.
    async fn get_vm(&self, id: i64, token: &str) -> Result<Option<VmRecord>>;

    /// One work request.
    async fn get_request(&self, id: i64, token: &str) -> Result<WorkRequest>;

    /// Work requests on `vm_id` that have not completed.
    async fn open_requests(&self, vm_id: i64, token: &str) -> Result<Vec<WorkRequest>>;

    /// Request power on.
    async fn power_on(&self, vm_id: i64, token: &str) -> Result<WorkRequest>;

    /// Request a forced power off.
    async fn force_off(&self, vm_id: i64, token: &str) -> Result<WorkRequest>;

    /// Request a revert to `snapshot_id`.
    async fn revert_snapshot(&self, vm_id: i64, snapshot_id: i64, token: &str)
        -> Result<WorkRequest>;
}

/// Wait bounds for work requests.
#[derive(Debug, Clone, Copy)]
pub struct VLaunchTimeouts {
    /// Snapshot revert.
    pub restore: Duration,
    /// Power on.
    pub power_on: Duration,
    /// Forced power off.
    pub power_off: Duration,
    /// Sampling interval.
    pub poll: Duration,
}

impl From<&VLaunchConfig> for VLaunchTimeouts {
    fn from(config: &VLaunchConfig) -> Self {
        Self {
            restore: config.restore_timeout,
            power_on: config.power_on_timeout,
            power_off: config.power_off_timeout,
            poll: config.poll_interval,
        }
    }
}

impl Default for VLaunchTimeouts {
    fn default() -> Self {
        Self::from(&VLaunchConfig::default())
    }
}

/// vLaunch adapter.
#[derive(Debug)]
pub struct VLaunchAdapter {
    name: String,
    service: Arc<dyn LaunchService>,
    default_token: String,
    domain: String,
    timeouts: VLaunchTimeouts,
    ids: Mutex<HashMap<String, i64>>,
    serializer: ResourceSerializer,
}

impl VLaunchAdapter {
    /// Adapter backed by the HTTP client, with the fallback token read
    /// from the configured environment variable.
    pub fn from_config(name: &str, config: &VLaunchConfig) -> Result<Self> {
        let token = secret_from_env(&config.env_token)?;
        let client = VLaunchClient::new(config)?;
        Ok(Self::new(
            name,
            Arc::new(client),
            token,
            config.domain.clone(),
            VLaunchTimeouts::from(config),
        ))
    }

    /// Adapter over any [`LaunchService`].
    pub fn new(
        name: &str,
        service: Arc<dyn LaunchService>,
        default_token: String,
        domain: String,
        timeouts: VLaunchTimeouts,
    ) -> Self {
        Self {
            name: name.to_string(),
            service,
            default_token,
            domain,
            timeouts,
            ids: Mutex::new(HashMap::new()),
            serializer: ResourceSerializer::new(format!("{}-vms", name)),
        }
    }

    /// The device owner's token, else the configured default.
    fn token<'a>(&'a self, ctx: &'a VmContext) -> &'a str {
        ctx.owner
            .as_ref()
            .and_then(|owner| owner.vlaunchtoken.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.default_token)
    }

    async fn resolve_id(&self, vm: &str, token: &str) -> Result<i64> {
        if let Some(id) = self.ids.lock().get(vm) {
            return Ok(*id);
        }

        let listed = self.service.list_vms(token).await?;
        let refreshed: HashMap<String, i64> =
            listed.into_iter().map(|r| (r.vmname, r.id)).collect();
        tracing::debug!(hypervisor = %self.name, vms = refreshed.len(), "refreshed vm id cache");
        let id = refreshed.get(vm).copied();
        *self.ids.lock() = refreshed;

        id.ok_or_else(|| Error::backend(&self.name, format!("could not find VM {} in VM list", vm)))
    }

    async fn record(&self, vm: &str, token: &str) -> Result<VmRecord> {
        let id = self.resolve_id(vm, token).await?;
        if let Some(record) = self.service.get_vm(id, token).await? {
            return Ok(record);
        }

        tracing::info!(vm = %vm, id, "cached vm id is stale, resolving again");
        self.ids.lock().remove(vm);
        let id = self.resolve_id(vm, token).await?;
        self.service
            .get_vm(id, token)
            .await?
            .ok_or_else(|| Error::backend(&self.name, format!("VM {} vanished during lookup", vm)))
    }

    async fn ensure_idle(&self, vm: &str, vm_id: i64, token: &str) -> Result<()> {
        let open = self
            .service
            .open_requests(vm_id, token)
            .await?
            .into_iter()
            .filter(|r| r.status != REQUEST_CANCELED)
            .count();
        if open > 0 {
            return Err(Error::backend(
                &self.name,
                format!("VM {} has another request pending", vm),
            ));
        }
        Ok(())
    }

    async fn await_request(&self, request: WorkRequest, timeout: Duration, token: &str) -> Result<()> {
        let service = &self.service;
        let id = request.id;
        PollingWaiter::new(
            format!("work request {}", id),
            REQUEST_COMPLETED.to_string(),
            timeout,
        )
        .abort_on(REQUEST_ERROR.to_string())
        .interval(self.timeouts.poll)
        .wait(|| async move { Ok::<_, Error>(service.get_request(id, token).await?.status) })
        .await?;
        Ok(())
    }

    async fn power_on(&self, vm: &str, token: &str) -> Result<OpResult> {
        let record = self.record(vm, token).await?;
        self.ensure_idle(vm, record.id, token).await?;
        if record.power_state == POWERED_ON {
            return Ok(OpResult::ok(format!("VM {} is already powered on.", vm)));
        }
        let request = self.service.power_on(record.id, token).await?;
        self.await_request(request, self.timeouts.power_on, token).await?;
        tracing::info!(vm = %vm, hypervisor = %self.name, "powered on");
        Ok(OpResult::ok(format!("Powered on VM {}.", vm)))
    }

    async fn power_off(&self, vm: &str, token: &str) -> Result<OpResult> {
        let record = self.record(vm, token).await?;
        self.ensure_idle(vm, record.id, token).await?;
        if record.power_state != POWERED_ON {
            return Ok(OpResult::ok(format!("VM {} is already powered off.", vm)));
        }
        let request = self.service.force_off(record.id, token).await?;
        self.await_request(request, self.timeouts.power_off, token).await?;
        tracing::info!(vm = %vm, hypervisor = %self.name, "powered off");
        Ok(OpResult::ok(format!("Powered off VM {}.", vm)))
    }

    async fn revert(&self, vm: &str, snapshot: &str, token: &str) -> Result<OpResult> {
        let record = self.record(vm, token).await?;
        let snapshot_id = record
            .snapshots
            .iter()
            .find(|s| s.name == snapshot)
            .map(|s| s.id)
            .ok_or_else(|| Error::SnapshotNotFound {
                vm: vm.to_string(),
                snapshot: snapshot.to_string(),
            })?;
        if record.power_state != POWERED_OFF {
            return Err(Error::invalid_state(POWERED_OFF, &record.power_state));
        }
        self.ensure_idle(vm, record.id, token).await?;
        let request = self
            .service
            .revert_snapshot(record.id, snapshot_id, token)
            .await?;
        self.await_request(request, self.timeouts.restore, token).await?;
        Ok(OpResult::ok(format!(
            "Restored VM {} to snapshot {}.",
            vm, snapshot
        )))
    }
}

#[async_trait]
impl HypervisorAdapter for VLaunchAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "vlaunch"
    }

    async fn state(&self, vm: &str, ctx: &VmContext) -> Result<CanonicalState> {
        let _permit = self.serializer.enter(vm).await;
        Ok(self.record(vm, self.token(ctx)).await?.canonical_state())
    }

    async fn lease_vm(&self, _vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        Ok(OpResult::ok("Ok."))
    }

    async fn unlease_vm(&self, _vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        Ok(OpResult::ok("Ok."))
    }

    async fn start_vm(&self, vm: &str, _snapshot: &str, ctx: &VmContext) -> Result<OpResult> {
        let _permit = self.serializer.enter(vm).await;
        self.power_on(vm, self.token(ctx)).await
    }

    async fn stop_vm(&self, vm: &str, ctx: &VmContext) -> Result<OpResult> {
        let _permit = self.serializer.enter(vm).await;
        self.power_off(vm, self.token(ctx)).await
    }

    async fn restore_vm(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult> {
        let _permit = self.serializer.enter(vm).await;
        self.revert(vm, snapshot, self.token(ctx)).await
    }

    async fn take_snapshot(&self, _vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        Err(Error::not_implemented(&self.name, "take_snapshot"))
    }

    async fn rename_snapshot(
        &self,
        _vm: &str,
        _src: &str,
        _dst: &str,
        _ctx: &VmContext,
    ) -> Result<OpResult> {
        Err(Error::not_implemented(&self.name, "rename_snapshot"))
    }

    async fn get_ip(&self, vm: &str, _ctx: &VmContext) -> Result<Option<String>> {
        Ok(resolve_host(vm, &self.domain).await)
    }
}
