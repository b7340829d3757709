//! OpenStack backend.
//!
//! Leasing a VM here means nothing until it is started: start boots a
//! fresh instance from the bound snapshot image and attaches a floating
//! address, stop pauses it, and unlease or restore terminate it so the
//! next start boots clean.
//!
//! The compute control plane sits behind [`ComputeApi`] so the state
//! machine can be driven without a cloud.

use crate::config::OpenStackConfig;
use crate::error::{Error, Result};
use crate::poll::PollingWaiter;
use crate::sync::ResourceSerializer;
use crate::vm::backend::FLOATING_IP_KEY;
use crate::vm::{CanonicalState, HypervisorAdapter, VmContext};
use async_trait::async_trait;
use leasepool_protocol::OpResult;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Compute and floating-address operations of one cloud.
#[async_trait]
pub trait ComputeApi: Send + Sync + Debug {
    /// Canonical state of `vm`; `NON_EXISTENT` when no instance has the name.
    async fn state(&self, vm: &str) -> Result<CanonicalState>;

    /// Boot instance `vm` from `image` with `flavor`.
    async fn boot(&self, vm: &str, flavor: &str, image: &str) -> Result<()>;

    /// Delete instance `vm`.
    async fn delete(&self, vm: &str) -> Result<()>;

    /// Pause instance `vm`.
    async fn pause(&self, vm: &str) -> Result<()>;

    /// Unpause instance `vm`.
    async fn unpause(&self, vm: &str) -> Result<()>;

    /// Attach a floating address from the shared pool to `vm`.
    async fn associate(&self, vm: &str) -> Result<()>;

    /// Return `vm`'s floating address to the pool.
    async fn deassociate(&self, vm: &str) -> Result<()>;

    /// Floating address currently attached to `vm`.
    async fn associated_ip(&self, vm: &str) -> Result<Option<String>>;
}

/// Wait bounds for the OpenStack state machine.
#[derive(Debug, Clone, Copy)]
pub struct OpenStackTimeouts {
    /// Pause after boot before polling starts.
    pub boot_settle: Duration,
    /// Bound on reaching `ACTIVE`.
    pub active: Duration,
    /// Bound on reaching `PAUSED`.
    pub pause: Duration,
    /// Bound on reaching `NON_EXISTENT`.
    pub terminate: Duration,
    /// Sampling interval.
    pub poll: Duration,
}

impl From<&OpenStackConfig> for OpenStackTimeouts {
    fn from(config: &OpenStackConfig) -> Self {
        Self {
            boot_settle: config.boot_settle,
            active: config.active_timeout,
            pause: config.pause_timeout,
            terminate: config.terminate_timeout,
            poll: config.poll_interval,
        }
    }
}

impl Default for OpenStackTimeouts {
    fn default() -> Self {
        Self::from(&OpenStackConfig::default())
    }
}

/// OpenStack adapter.
#[derive(Debug)]
pub struct OpenStackAdapter {
    name: String,
    api: Arc<dyn ComputeApi>,
    floating_ips: Arc<ResourceSerializer>,
    default_flavor: String,
    timeouts: OpenStackTimeouts,
}

impl OpenStackAdapter {
    /// Adapter for binding `name`. Floating-address association runs
    /// through `floating_ips` under one shared key.
    pub fn new(
        name: &str,
        api: Arc<dyn ComputeApi>,
        floating_ips: Arc<ResourceSerializer>,
        default_flavor: String,
        timeouts: OpenStackTimeouts,
    ) -> Self {
        Self {
            name: name.to_string(),
            api,
            floating_ips,
            default_flavor,
            timeouts,
        }
    }

    fn flavor<'a>(&'a self, ctx: &'a VmContext) -> &'a str {
        ctx.device
            .flavor
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(&self.default_flavor)
    }

    async fn wait_for(
        &self,
        vm: &str,
        desired: CanonicalState,
        timeout: Duration,
        abort_on_error: bool,
    ) -> Result<CanonicalState> {
        let mut waiter = PollingWaiter::new(vm, desired, timeout).interval(self.timeouts.poll);
        if abort_on_error {
            waiter = waiter.abort_on(CanonicalState::Error);
        }
        waiter.wait(|| self.api.state(vm)).await
    }

    /// Boot, wait for `ACTIVE`, then attach a floating address. Any
    /// failure after the boot call tears the instance down again.
    async fn launch(&self, vm: &str, image: &str, ctx: &VmContext) -> Result<()> {
        let flavor = self.flavor(ctx);
        tracing::info!(vm = %vm, image = %image, flavor = %flavor, "booting instance");
        self.api.boot(vm, flavor, image).await?;

        tokio::time::sleep(self.timeouts.boot_settle).await;

        if let Err(e) = self
            .wait_for(vm, CanonicalState::Active, self.timeouts.active, true)
            .await
        {
            tracing::warn!(vm = %vm, error = %e, "instance did not become active");
            self.compensate(vm).await;
            return Err(e);
        }

        let associated = {
            let _permit = self.floating_ips.enter(FLOATING_IP_KEY).await;
            self.api.associate(vm).await
        };
        if let Err(e) = associated {
            tracing::warn!(vm = %vm, error = %e, "floating address association failed");
            self.compensate(vm).await;
            return Err(e);
        }

        tracing::info!(vm = %vm, "instance active with floating address");
        Ok(())
    }

    /// Deassociate (best effort), delete, and wait for the instance to
    /// disappear.
    async fn terminate(&self, vm: &str) -> Result<()> {
        if let Err(e) = self.api.deassociate(vm).await {
            tracing::warn!(vm = %vm, error = %e, "ignoring deassociate failure");
        }
        self.api.delete(vm).await?;
        self.wait_for(vm, CanonicalState::NonExistent, self.timeouts.terminate, false)
            .await?;
        tracing::info!(vm = %vm, "instance deleted");
        Ok(())
    }

    /// Best-effort terminate. The outcome is logged and dropped.
    async fn compensate(&self, vm: &str) {
        tracing::info!(vm = %vm, "terminating partially provisioned instance");
        if let Err(e) = self.terminate(vm).await {
            tracing::warn!(vm = %vm, error = %e, "ignoring terminate failure during cleanup");
        }
    }
}

#[async_trait]
impl HypervisorAdapter for OpenStackAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "openstack"
    }

    async fn state(&self, vm: &str, _ctx: &VmContext) -> Result<CanonicalState> {
        self.api.state(vm).await
    }

    async fn lease_vm(&self, _vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        Ok(OpResult::ok("Ok. Instance is booted on start."))
    }

    async fn unlease_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        match self.api.state(vm).await? {
            CanonicalState::Active => Err(Error::invalid_state("not running", CanonicalState::Active)),
            CanonicalState::NonExistent => Ok(OpResult::ok(format!("Unleased VM {}.", vm))),
            CanonicalState::Paused => {
                self.terminate(vm).await?;
                Ok(OpResult::ok(format!("Unleased and deleted VM {}.", vm)))
            }
            other => {
                tracing::warn!(vm = %vm, state = %other, "unexpected state on unlease, forcing terminate");
                self.compensate(vm).await;
                Ok(OpResult::ok(format!(
                    "Unleased VM {} after forced terminate from state {}.",
                    vm, other
                )))
            }
        }
    }

    async fn start_vm(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult> {
        let state = self.api.state(vm).await?;
        if !state.can_start() {
            return Err(Error::invalid_state("PAUSED or NON_EXISTENT", state));
        }
        match state {
            CanonicalState::Active => Ok(OpResult::ok(format!("VM {} is already started.", vm))),
            CanonicalState::Paused => {
                self.api.unpause(vm).await?;
                self.wait_for(vm, CanonicalState::Active, self.timeouts.active, true)
                    .await?;
                Ok(OpResult::ok(format!("Unpaused VM {}.", vm)))
            }
            _ => {
                self.launch(vm, snapshot, ctx).await?;
                Ok(OpResult::ok(format!(
                    "Launched VM {} from snapshot {}.",
                    vm, snapshot
                )))
            }
        }
    }

    async fn stop_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        let state = self.api.state(vm).await?;
        if state != CanonicalState::Active {
            return Ok(OpResult::ok(format!("VM {} is not active.", vm)));
        }
        self.api.pause(vm).await?;
        self.wait_for(vm, CanonicalState::Paused, self.timeouts.pause, false)
            .await?;
        Ok(OpResult::ok(format!("Paused VM {}.", vm)))
    }

    async fn restore_vm(&self, vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        let state = self.api.state(vm).await?;
        if !state.can_restore() {
            return Err(Error::invalid_state("PAUSED or NON_EXISTENT", state));
        }
        if state == CanonicalState::NonExistent {
            return Ok(OpResult::ok(format!("VM {} is already restored.", vm)));
        }
        self.terminate(vm).await?;
        Ok(OpResult::ok(format!(
            "Restored VM {}; the next start boots a fresh instance.",
            vm
        )))
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
        match self.api.associated_ip(vm).await {
            Ok(ip) => Ok(ip),
            Err(e) => {
                tracing::debug!(vm = %vm, error = %e, "could not find floating address");
                Ok(None)
            }
        }
    }
}
