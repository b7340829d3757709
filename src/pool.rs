//! Orchestration facade.
//!
//! [`Pool`] is what the REST layer calls. Each operation resolves a device
//! from the catalog, checks who may act on it, hands the device's adapter
//! the current catalog context, and records the outcome in the lease,
//! snapshot and activity stores.
//!
//! Mutating operations on one device are admitted one at a time through a
//! per-device [`ResourceSerializer`]. The in-memory stores sit behind a
//! plain mutex that is only taken between awaits, so a multi-minute boot
//! on one device never blocks work on another.

use crate::activity::ActivityLog;
use crate::catalog::{contains_all, Catalog};
use crate::config::{LeasePolicy, ServerConfig};
use crate::error::{Error, Result};
use crate::lease::LeaseRegistry;
use crate::notify::{self, Notifier};
use crate::process::{self, CommandRunner, TokioCommandRunner};
use crate::snapshots::{archive_name, validate_name, SnapshotBindings};
use crate::sync::ResourceSerializer;
use crate::vm::backend::{self, AdapterMap, SharedResources};
use crate::vm::{HypervisorAdapter, VmContext};
use chrono::{DateTime, Utc};
use leasepool_protocol::{Device, DeviceView, OpResult, User};
use parking_lot::Mutex;
use std::sync::Arc;

/// Reachability check command.
const PING: &str = "ping";

/// Marker `ping` prints for every echo reply.
const PING_REPLY: &str = "bytes from";

/// Stores mutated by the facade.
#[derive(Debug)]
struct PoolState {
    catalog: Catalog,
    leases: LeaseRegistry,
    snapshots: SnapshotBindings,
    activity: ActivityLog,
}

impl PoolState {
    fn context(&self, device: &Device) -> VmContext {
        VmContext {
            device: device.clone(),
            lessor: self
                .leases
                .lessor_of(&device.name)
                .and_then(|name| self.catalog.user(name))
                .cloned(),
            owner: device
                .owner
                .as_deref()
                .and_then(|name| self.catalog.user(name))
                .cloned(),
        }
    }

    fn view(&self, device: &Device, viewer: Option<&str>) -> DeviceView {
        let lease = self.leases.peek(&device.name);
        let visible = viewer.is_some() && lease.holder() == viewer;
        DeviceView {
            device: if visible {
                device.clone()
            } else {
                device.redacted()
            },
            available: lease.available.to_string(),
            lessor: lease.lessor,
        }
    }

    /// Admin plus `lessor`, once each, skipping identities without a
    /// user record.
    fn recipients(&self, admin: &str, lessor: &str) -> Vec<User> {
        let mut names = vec![admin];
        if lessor != admin {
            names.push(lessor);
        }
        names
            .into_iter()
            .filter_map(|name| self.catalog.user(name).cloned())
            .collect()
    }
}

/// Everything a VM action needs, captured under the state lock.
struct Prepared {
    adapter: Arc<dyn HypervisorAdapter>,
    ctx: VmContext,
    snapshot: String,
}

/// The device lease orchestrator.
#[derive(Debug)]
pub struct Pool {
    admin_user: String,
    update_user: String,
    policy: LeasePolicy,
    adapters: AdapterMap,
    notifier: Arc<dyn Notifier>,
    runner: Arc<dyn CommandRunner>,
    devices: ResourceSerializer,
    state: Mutex<PoolState>,
}

impl Pool {
    /// Open the stores under `config.data_dir` and serve them through
    /// `adapters`.
    pub fn open(
        config: &ServerConfig,
        adapters: AdapterMap,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let data_dir = &config.data_dir;
        let state = PoolState {
            catalog: Catalog::open(data_dir)?,
            leases: LeaseRegistry::open(data_dir)?,
            snapshots: SnapshotBindings::open(data_dir)?,
            activity: ActivityLog::default(),
        };

        for device in state.catalog.devices() {
            if let Some(binding) = &device.hypervisor {
                if !adapters.contains_key(binding) {
                    tracing::warn!(device = %device.name, hypervisor = %binding, "device names an unconfigured hypervisor");
                }
            }
        }

        Ok(Self {
            admin_user: config.admin_user.clone(),
            update_user: config.update_user.clone(),
            policy: config.lease.clone(),
            adapters,
            notifier,
            runner: Arc::new(TokioCommandRunner::new(config.command_timeout)),
            devices: ResourceSerializer::new("devices"),
            state: Mutex::new(state),
        })
    }

    /// Build adapters and the notifier from `config`, then open the pool.
    pub fn from_config(config: &ServerConfig, shared: &SharedResources) -> Result<Self> {
        let adapters = backend::create_all(&config.hypervisors, shared)?;
        let notifier = notify::from_config(&config.notifier);
        Ok(Self::open(config, adapters, notifier)?.with_runner(shared.runner.clone()))
    }

    /// Run external checks such as ping through `runner`.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Number of configured hypervisor bindings.
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Whether `device` can be leased.
    pub fn is_available(&self, device: &str) -> bool {
        self.state.lock().leases.is_available(device)
    }

    fn adapter_for(&self, device: &Device) -> Result<Arc<dyn HypervisorAdapter>> {
        device
            .hypervisor
            .as_ref()
            .and_then(|binding| self.adapters.get(binding))
            .cloned()
            .ok_or_else(|| Error::HypervisorNotFound(device.name.clone()))
    }

    fn require_admin(&self, actor: &str) -> Result<()> {
        if actor != self.admin_user {
            return Err(Error::Unauthorized(format!(
                "only {} may edit the catalog",
                self.admin_user
            )));
        }
        Ok(())
    }

    fn require_update_user(&self, actor: &str) -> Result<()> {
        if actor != self.update_user {
            return Err(Error::Unauthorized(format!(
                "only {} may change snapshots, not {}",
                self.update_user, actor
            )));
        }
        Ok(())
    }

    /// Check that `name` is a VM leased by `actor` and capture what the
    /// adapter call needs.
    fn prepare(&self, name: &str, actor: &str) -> Result<Prepared> {
        let state = self.state.lock();
        let device = state.catalog.require_device(name)?;
        if !device.is_virtual() {
            return Err(Error::NotVirtual(name.to_string()));
        }
        match state.leases.lessor_of(name) {
            None => return Err(Error::NotLeased(name.to_string())),
            Some(lessor) if lessor != actor => {
                return Err(Error::NotLessee {
                    device: name.to_string(),
                    actor: actor.to_string(),
                })
            }
            Some(_) => {}
        }
        Ok(Prepared {
            adapter: self.adapter_for(device)?,
            ctx: state.context(device),
            snapshot: state.snapshots.name(name).to_string(),
        })
    }

    fn record(&self, device: &str, actor: &str, action: &str) {
        self.state
            .lock()
            .activity
            .record(device, actor, action, Utc::now());
    }

    async fn notify(&self, lessor: &str, subject: String) {
        let recipients = self.state.lock().recipients(&self.admin_user, lessor);
        notify::deliver(self.notifier.as_ref(), &recipients, &subject, "").await;
    }

    // ------------------------------------------------------------------
    // Leasing
    // ------------------------------------------------------------------

    /// Lease the device called `name` to `lessor`.
    pub async fn lease_by_name(&self, name: &str, lessor: &str) -> Result<OpResult> {
        self.lease_device(name, lessor).await
    }

    /// Lease the first available device running `os`.
    pub async fn lease_by_os(&self, os: &str, lessor: &str) -> Result<OpResult> {
        self.lease_first(lessor, format!("os={}", os), |d| d.os == os)
            .await
    }

    /// Lease the first available device with `os`, `bits`, and every item
    /// of the comma-separated `contents`.
    pub async fn lease_by_contents(
        &self,
        contents: &str,
        os: &str,
        bits: &str,
        lessor: &str,
    ) -> Result<OpResult> {
        let wanted = format!("contents={} os={} bits={}", contents, os, bits);
        self.lease_first(lessor, wanted, |d| {
            d.os == os && d.bits == bits && contains_all(&d.contents, contents)
        })
        .await
    }

    async fn lease_first<F>(&self, lessor: &str, wanted: String, matches: F) -> Result<OpResult>
    where
        F: Fn(&Device) -> bool,
    {
        let candidates: Vec<String> = {
            let state = self.state.lock();
            state.catalog.require_user(lessor)?;
            state
                .catalog
                .devices()
                .iter()
                .filter(|d| matches(d) && permits(d, lessor))
                .filter(|d| state.leases.is_available(&d.name))
                .map(|d| d.name.clone())
                .collect()
        };

        for name in candidates {
            match self.lease_device(&name, lessor).await {
                // Taken by a concurrent request since the scan.
                Err(Error::AlreadyLeased { .. }) => continue,
                other => return other,
            }
        }
        Err(Error::NoMatch(wanted))
    }

    async fn lease_device(&self, name: &str, lessor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;

        let (device, user, virtual_vm) = {
            let state = self.state.lock();
            let device = state.catalog.require_device(name)?.clone();
            let user = state.catalog.require_user(lessor)?.clone();
            if let Some(holder) = state.leases.lessor_of(name) {
                return Err(Error::AlreadyLeased {
                    device: name.to_string(),
                    lessor: holder.to_string(),
                });
            }
            if !permits(&device, lessor) {
                return Err(Error::NotPermitted {
                    device: name.to_string(),
                    user: lessor.to_string(),
                });
            }
            let virtual_vm = if device.is_virtual() {
                Some(Prepared {
                    adapter: self.adapter_for(&device)?,
                    ctx: state.context(&device),
                    snapshot: state.snapshots.name(name).to_string(),
                })
            } else {
                None
            };
            (device, user, virtual_vm)
        };

        if let Some(vm) = &virtual_vm {
            vm.adapter.lease_vm(name, &vm.snapshot, &vm.ctx).await?;
        }

        let recorded = {
            let mut state = self.state.lock();
            let now = Utc::now();
            match state.leases.lease(name, &user, now) {
                Ok(()) => {
                    state.activity.record(name, lessor, "Leased", now);
                    Ok(state.view(&device, Some(lessor)))
                }
                Err(e) => Err(e),
            }
        };
        let view = match recorded {
            Ok(view) => view,
            Err(e) => {
                if let Some(vm) = &virtual_vm {
                    if let Err(undo) = vm.adapter.unlease_vm(name, &vm.ctx).await {
                        tracing::warn!(device = %name, error = %undo, "could not undo vm lease preparation");
                    }
                }
                return Err(e);
            }
        };
        tracing::info!(device = %name, lessor = %lessor, "device leased");

        self.notify(lessor, format!("{} leased {}", lessor, name)).await;

        Ok(OpResult::ok(format!("Leased device {}.", name))
            .with("name", name)
            .with("device", serde_json::to_value(view)?))
    }

    /// Release `name`. Only the current lessor may do this, and a VM must
    /// not be running.
    pub async fn unlease(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;

        let virtual_vm = {
            let state = self.state.lock();
            let device = state.catalog.require_device(name)?;
            match state.leases.lessor_of(name) {
                None => return Err(Error::NotLeased(name.to_string())),
                Some(lessor) if lessor != actor => {
                    return Err(Error::NotLessee {
                        device: name.to_string(),
                        actor: actor.to_string(),
                    })
                }
                Some(_) => {}
            }
            if device.is_virtual() {
                Some((self.adapter_for(device)?, state.context(device)))
            } else {
                None
            }
        };

        if let Some((adapter, ctx)) = virtual_vm {
            let vm_state = adapter.state(name, &ctx).await?;
            if vm_state.is_running() {
                return Err(Error::invalid_state("stopped", vm_state));
            }
            if let Err(e) = adapter.unlease_vm(name, &ctx).await {
                tracing::warn!(device = %name, error = %e, "vm teardown failed, releasing lease anyway");
            }
        }

        {
            let mut state = self.state.lock();
            state.leases.unlease(name)?;
            state.activity.record(name, actor, "Unleased", Utc::now());
        }
        tracing::info!(device = %name, lessor = %actor, "device unleased");

        self.notify(actor, format!("{} unleased {}", actor, name)).await;

        Ok(OpResult::ok(format!("Unleased device ok. device={}", name)).with("name", name))
    }

    // ------------------------------------------------------------------
    // VM lifecycle
    // ------------------------------------------------------------------

    /// Start `name` from its bound snapshot.
    pub async fn start(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        let result = vm.adapter.start_vm(name, &vm.snapshot, &vm.ctx).await?;
        self.record(name, actor, "Started");
        Ok(result.with("name", name))
    }

    /// Stop `name`.
    pub async fn stop(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        let result = vm.adapter.stop_vm(name, &vm.ctx).await?;
        self.record(name, actor, "Stopped");
        Ok(result.with("name", name))
    }

    /// Restore `name` to its bound snapshot.
    pub async fn restore(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        let result = vm
            .adapter
            .restore_vm(name, &vm.snapshot, &vm.ctx)
            .await?;
        self.record(name, actor, "Restored");
        Ok(result
            .with("name", name)
            .with("snapshot", vm.snapshot))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Take the bound snapshot of `name`, replacing any existing one.
    pub async fn take_snapshot(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        self.require_update_user(actor)?;
        vm.adapter
            .take_snapshot(name, &vm.snapshot, &vm.ctx)
            .await?;
        self.record(name, actor, "Took snapshot");
        Ok(OpResult::ok(format!(
            "Took snapshot. vm name={} new snapshot={}",
            name, vm.snapshot
        ))
        .with("name", name)
        .with("newSnapshotName", vm.snapshot))
    }

    /// Rename the bound snapshot of `name` to `new_name`, or to a
    /// timestamped archive name.
    pub async fn rename_snapshot(
        &self,
        name: &str,
        actor: &str,
        new_name: Option<&str>,
    ) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        self.require_update_user(actor)?;
        let dst = new_name
            .map(str::to_string)
            .unwrap_or_else(|| archive_name(Utc::now()));
        validate_name(&dst)?;

        vm.adapter
            .rename_snapshot(name, &vm.snapshot, &dst, &vm.ctx)
            .await?;
        self.record(name, actor, "Renamed snapshot");
        Ok(OpResult::ok(format!(
            "Renamed snapshot. vm name={} old snapshot={} new snapshot={}",
            name, vm.snapshot, dst
        ))
        .with("name", name)
        .with("oldSnapshotName", vm.snapshot)
        .with("newSnapshotName", dst))
    }

    /// Archive the bound snapshot of a stopped VM and take a fresh one
    /// under the bound name.
    pub async fn update_snapshot(&self, name: &str, actor: &str) -> Result<OpResult> {
        let _permit = self.devices.enter(name).await;
        let vm = self.prepare(name, actor)?;
        self.require_update_user(actor)?;

        let vm_state = vm.adapter.state(name, &vm.ctx).await?;
        if vm_state.is_running() {
            return Err(Error::invalid_state("stopped", vm_state));
        }

        let archived = archive_name(Utc::now());
        vm.adapter
            .rename_snapshot(name, &vm.snapshot, &archived, &vm.ctx)
            .await?;
        vm.adapter
            .take_snapshot(name, &vm.snapshot, &vm.ctx)
            .await?;
        self.record(name, actor, "Updated snapshot");
        Ok(OpResult::ok(format!(
            "Updated snapshot. vmname={} renamedSnapshotName={} newSnapshotName={}",
            name, archived, vm.snapshot
        ))
        .with("name", name)
        .with("oldSnapshotName", vm.snapshot.clone())
        .with("renamedSnapshotName", archived)
        .with("newSnapshotName", vm.snapshot))
    }

    /// Bind `name` to restore from `snapshot` from now on.
    pub async fn bind_snapshot(&self, name: &str, actor: &str, snapshot: &str) -> Result<OpResult> {
        if actor != self.admin_user {
            self.require_update_user(actor)?;
        }
        let _permit = self.devices.enter(name).await;
        {
            let mut state = self.state.lock();
            let device = state.catalog.require_device(name)?;
            if !device.is_virtual() {
                return Err(Error::NotVirtual(name.to_string()));
            }
            state.snapshots.bind(name, snapshot)?;
            state
                .activity
                .record(name, actor, &format!("Bound snapshot {}", snapshot), Utc::now());
        }
        Ok(OpResult::ok(format!("VM {} now restores to snapshot {}.", name, snapshot))
            .with("name", name)
            .with("snapshot", snapshot))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run state and recent activity of VM `name`.
    pub async fn query_status(&self, name: &str) -> Result<OpResult> {
        let (adapter, ctx) = {
            let state = self.state.lock();
            let device = state.catalog.require_device(name)?;
            if !device.is_virtual() {
                return Err(Error::NotVirtual(name.to_string()));
            }
            (self.adapter_for(device)?, state.context(device))
        };

        let vm_state = adapter.state(name, &ctx).await?;
        let running = vm_state.is_running();

        let (last, history) = {
            let state = self.state.lock();
            let last = state
                .activity
                .last(name)
                .map(ToString::to_string)
                .unwrap_or_default();
            let history: Vec<String> = state
                .activity
                .recent(name)
                .iter()
                .map(ToString::to_string)
                .collect();
            (last, history)
        };

        Ok(OpResult::ok(format!("Got status for VM {}", name))
            .with("name", name)
            .with("running", running)
            .with("vmstatus", if running { "running" } else { "stopped" })
            .with("state", vm_state.name())
            .with("activity", last)
            .with("history", history))
    }

    /// Network address of `name`; empty when it cannot be resolved.
    pub async fn query_address(&self, name: &str) -> Result<OpResult> {
        let (adapter, ctx) = {
            let state = self.state.lock();
            let device = state.catalog.require_device(name)?;
            if !device.is_virtual() {
                return Err(Error::NotVirtual(name.to_string()));
            }
            (self.adapter_for(device)?, state.context(device))
        };

        let ip = match adapter.get_ip(name, &ctx).await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!(device = %name, error = %e, "address lookup failed");
                None
            }
        };
        let msg = match &ip {
            Some(ip) => format!("Returning IP for VM {} ip={}", name, ip),
            None => format!("Did not find IP for VM {}", name),
        };
        Ok(OpResult::ok(msg)
            .with("name", name)
            .with("ip", ip.unwrap_or_default()))
    }

    /// Whether `hostname` answers a single echo request within two seconds.
    pub async fn can_ping(&self, hostname: &str) -> Result<OpResult> {
        validate_hostname(hostname)?;
        let args = process::args(["-c", "1", "-W", "2", hostname]);
        let output = self.runner.run(PING, &args).await?;
        if output.status == Some(0) && output.stdout.contains(PING_REPLY) {
            tracing::debug!(hostname = %hostname, "host answered ping");
            return Ok(OpResult::ok(format!("Ok. Can ping {}.", hostname)).with("hostname", hostname));
        }
        tracing::debug!(hostname = %hostname, output = %output.summary(), "host did not answer ping");
        Err(Error::backend(
            PING,
            format!("Can not ping {}: {}", hostname, output.summary()),
        ))
    }

    /// Every device joined with its lease state. Credentials are blanked
    /// on devices not leased by `lessor`.
    pub fn list_devices(&self, lessor: &str) -> Vec<DeviceView> {
        let state = self.state.lock();
        state
            .catalog
            .devices()
            .iter()
            .map(|d| state.view(d, Some(lessor)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Add `device` to the catalog.
    pub async fn add_device(&self, actor: &str, device: Device) -> Result<OpResult> {
        self.require_admin(actor)?;
        if device.is_virtual() {
            self.adapter_for(&device)?;
        }
        let name = device.name.clone();
        let _permit = self.devices.enter(&name).await;
        {
            let mut state = self.state.lock();
            state.catalog.add_device(device)?;
            state.activity.record(&name, actor, "Added", Utc::now());
        }
        Ok(OpResult::ok(format!("Added device {}.", name)).with("name", name))
    }

    /// Remove `name` from the catalog. Leased devices stay.
    pub async fn remove_device(&self, actor: &str, name: &str) -> Result<OpResult> {
        self.require_admin(actor)?;
        let _permit = self.devices.enter(name).await;
        {
            let mut state = self.state.lock();
            state.catalog.require_device(name)?;
            if let Some(holder) = state.leases.lessor_of(name) {
                return Err(Error::AlreadyLeased {
                    device: name.to_string(),
                    lessor: holder.to_string(),
                });
            }
            state.catalog.remove_device(name)?;
            state.leases.forget(name)?;
            state.activity.record(name, actor, "Removed", Utc::now());
        }
        Ok(OpResult::ok(format!("Removed device {}.", name)).with("name", name))
    }

    /// Re-read the device and user catalogs from disk.
    pub fn reload_catalog(&self) -> Result<OpResult> {
        let mut state = self.state.lock();
        state.catalog.reload()?;
        let devices = state.catalog.devices().len();
        Ok(OpResult::ok(format!("Reloaded catalog with {} devices.", devices))
            .with("devices", devices))
    }

    /// Remind holders of expired leases, at most once per
    /// `renotify_after` each. Returns how many reminders went out.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = {
            let mut state = self.state.lock();
            let notices =
                state
                    .leases
                    .due_notices(now, self.policy.max_duration, self.policy.renotify_after)?;
            notices
                .into_iter()
                .map(|notice| {
                    let recipients = state.recipients(&self.admin_user, &notice.lessor);
                    (notice, recipients)
                })
                .collect::<Vec<_>>()
        };

        for (notice, recipients) in &due {
            tracing::info!(device = %notice.device, lessor = %notice.lessor, "lease expired");
            let subject = format!("Lease expired: {} held by {}", notice.device, notice.lessor);
            let body = format!(
                "{} has held {} since {}. Please unlease it when you are done.",
                notice.lessor,
                notice.device,
                notice.leased_at.format("%Y-%m-%d %H:%M UTC")
            );
            notify::deliver(self.notifier.as_ref(), recipients, &subject, &body).await;
        }
        Ok(due.len())
    }
}

/// Whether `lessor` passes `device`'s allow-list. An empty list admits
/// everyone.
fn permits(device: &Device, lessor: &str) -> bool {
    device.permittedusers.is_empty() || device.permittedusers.iter().any(|u| u == lessor)
}

/// Host names and literal addresses only; nothing `ping` could read as a flag.
fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname.starts_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if !valid {
        return Err(Error::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}
