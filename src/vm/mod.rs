//! Hypervisor adapters and VM lifecycle.
//!
//! This module provides the backend-agnostic contract for controlling VMs:
//! - [`HypervisorAdapter`]: the uniform lifecycle contract every backend implements
//! - [`CanonicalState`]: the state vocabulary adapters map their native states onto
//! - [`VmContext`]: catalog context handed to each call
//!
//! Backends live in [`backend`] and are selected by configuration.

pub mod backend;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use async_trait::async_trait;
use leasepool_protocol::{Device, OpResult, User};
use std::fmt::Debug;

pub use state::CanonicalState;

/// Catalog context for one adapter call.
#[derive(Debug, Clone, Default)]
pub struct VmContext {
    /// The device record.
    pub device: Device,
    /// Current lessor, if leased.
    pub lessor: Option<User>,
    /// Administrative owner, if the device names one.
    pub owner: Option<User>,
}

/// Uniform VM lifecycle contract.
///
/// Every operation either succeeds with a result message (plus optional
/// extra fields) or fails with an [`Error`](crate::Error). Operations that
/// trigger a state change return only once the change is observed or a
/// bounded wait gives up.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync + Debug {
    /// Binding name from configuration.
    fn name(&self) -> &str;

    /// Backend kind (e.g. "virtualbox").
    fn kind(&self) -> &'static str;

    /// Current canonical state of `vm`.
    async fn state(&self, vm: &str, ctx: &VmContext) -> Result<CanonicalState>;

    /// Whether `vm` is running.
    async fn is_running(&self, vm: &str, ctx: &VmContext) -> Result<bool> {
        Ok(self.state(vm, ctx).await?.is_running())
    }

    /// Prepare `vm` for a new lessor.
    async fn lease_vm(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Tear down after a lessor releases `vm`. The VM must not be running.
    async fn unlease_vm(&self, vm: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Bring `vm` to `ACTIVE`.
    async fn start_vm(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Bring `vm` to a quiesced, paused, or non-existent state.
    async fn stop_vm(&self, vm: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Make `snapshot` the current state of `vm`. Refuses while active.
    async fn restore_vm(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Create or overwrite `snapshot` of `vm`.
    async fn take_snapshot(&self, vm: &str, snapshot: &str, ctx: &VmContext) -> Result<OpResult>;

    /// Rename snapshot `src` of `vm` to `dst`.
    async fn rename_snapshot(
        &self,
        vm: &str,
        src: &str,
        dst: &str,
        ctx: &VmContext,
    ) -> Result<OpResult>;

    /// Network address of `vm`. `None` when it cannot be resolved.
    async fn get_ip(&self, vm: &str, ctx: &VmContext) -> Result<Option<String>>;
}
