//! vSphere backend driven through the Perl toolkit scripts.

use crate::config::{secret_from_env, VSphereConfig};
use crate::error::{Error, Result};
use crate::poll::PollingWaiter;
use crate::process::{args, run_checked, CommandOutput, CommandRunner};
use crate::vm::backend::resolve_host;
use crate::vm::{CanonicalState, HypervisorAdapter, VmContext};
use async_trait::async_trait;
use leasepool_protocol::OpResult;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const VM_MISSING: &str = "No Virtual Machine Found";
const SNAPSHOT_MISSING: &str = "Snapshot Not Found";

/// vSphere toolkit adapter.
#[derive(Debug)]
pub struct VSphereAdapter {
    name: String,
    url: String,
    username: String,
    password: String,
    domain: String,
    scripts_dir: Option<PathBuf>,
    timeout: Duration,
    poll_interval: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl VSphereAdapter {
    /// Adapter for binding `name`, reading the password from the
    /// configured environment variable.
    pub fn from_config(
        name: &str,
        config: &VSphereConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let password = secret_from_env(&config.env_password)?;
        Ok(Self::with_password(name, config, password, runner))
    }

    /// Adapter for binding `name` with an explicit password.
    pub fn with_password(
        name: &str,
        config: &VSphereConfig,
        password: String,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.to_string(),
            url: config.url.clone(),
            username: config.username.clone(),
            password,
            domain: config.domain.clone(),
            scripts_dir: config.scripts_dir.clone(),
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            runner,
        }
    }

    fn script(&self, script: &str) -> String {
        match &self.scripts_dir {
            Some(dir) => dir.join(script).to_string_lossy().into_owned(),
            None => script.to_string(),
        }
    }

    async fn toolkit(&self, script: &str, operation: Vec<String>) -> Result<CommandOutput> {
        let mut argv = args([
            "--username",
            self.username.as_str(),
            "--password",
            self.password.as_str(),
            "--url",
            self.url.as_str(),
        ]);
        argv.extend(operation);
        run_checked(self.runner.as_ref(), &self.script(script), &argv, &[VM_MISSING, SNAPSHOT_MISSING]).await
    }

    async fn snapshot_manager(&self, vm: &str, snapshot: &str, operation: Vec<String>) -> Result<()> {
        match self.toolkit("snapshotmanager.pl", operation).await {
            Err(Error::CommandFailed { message, .. }) if message.contains(SNAPSHOT_MISSING) => {
                Err(Error::SnapshotNotFound {
                    vm: vm.to_string(),
                    snapshot: snapshot.to_string(),
                })
            }
            other => other.map(|_| ()),
        }
    }

    async fn running(&self, vm: &str) -> Result<bool> {
        let out = self
            .toolkit("guestinfo.pl", args(["--operation", "display", "--vmname", vm]))
            .await?;
        let banner = format!("Guest Info for the Virtual Machine '{}' under host", vm);
        Ok(out.stdout.contains(&banner))
    }

    async fn query_state(&self, vm: &str) -> Result<CanonicalState> {
        Ok(if self.running(vm).await? {
            CanonicalState::Active
        } else {
            CanonicalState::Paused
        })
    }

    async fn power(&self, vm: &str, operation: &str, desired: CanonicalState) -> Result<()> {
        self.toolkit("vmcontrol.pl", args(["--operation", operation, "--vmname", vm]))
            .await?;
        PollingWaiter::new(vm, desired, self.timeout)
            .interval(self.poll_interval)
            .wait(|| self.query_state(vm))
            .await?;
        tracing::info!(vm = %vm, hypervisor = %self.name, operation = %operation, "power operation complete");
        Ok(())
    }
}

#[async_trait]
impl HypervisorAdapter for VSphereAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "vsphere"
    }

    async fn state(&self, vm: &str, _ctx: &VmContext) -> Result<CanonicalState> {
        self.query_state(vm).await
    }

    async fn lease_vm(&self, _vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        Ok(OpResult::ok("Ok."))
    }

    async fn unlease_vm(&self, _vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        Ok(OpResult::ok("Ok."))
    }

    async fn start_vm(&self, vm: &str, _snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        if self.running(vm).await? {
            return Ok(OpResult::ok(format!("VM {} is already started.", vm)));
        }
        self.power(vm, "poweron", CanonicalState::Active).await?;
        Ok(OpResult::ok(format!("Started VM {}.", vm)))
    }

    async fn stop_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        if !self.running(vm).await? {
            return Ok(OpResult::ok(format!("VM {} is not active.", vm)));
        }
        self.power(vm, "poweroff", CanonicalState::Paused).await?;
        Ok(OpResult::ok(format!("Stopped VM {}.", vm)))
    }

    async fn restore_vm(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        if self.running(vm).await? {
            return Err(Error::invalid_state("stopped", CanonicalState::Active));
        }
        self.snapshot_manager(
            vm,
            snapshot,
            args(["--operation", "goto", "--vmname", vm, "--snapshotname", snapshot]),
        )
        .await?;
        Ok(OpResult::ok(format!(
            "Restored VM {} to snapshot {}.",
            vm, snapshot
        )))
    }

    async fn take_snapshot(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.snapshot_manager(
            vm,
            snapshot,
            args(["--operation", "create", "--vmname", vm, "--snapshotname", snapshot]),
        )
        .await?;
        Ok(OpResult::ok(format!("Took snapshot {} of VM {}.", snapshot, vm)))
    }

    async fn rename_snapshot(
        &self,
        vm: &str,
        src: &str,
        dst: &str,
        _ctx: &VmContext,
    ) -> Result<OpResult> {
        self.snapshot_manager(
            vm,
            src,
            args([
                "--operation",
                "rename",
                "--vmname",
                vm,
                "--snapshotname",
                src,
                "--newname",
                dst,
            ]),
        )
        .await?;
        Ok(OpResult::ok(format!(
            "Renamed snapshot {} of VM {} to {}.",
            src, vm, dst
        )))
    }

    async fn get_ip(&self, vm: &str, _ctx: &VmContext) -> Result<Option<String>> {
        Ok(resolve_host(vm, &self.domain).await)
    }
}
