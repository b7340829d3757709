//! VirtualBox backend driven through its management CLI.
//!
//! The CLI only reveals running versus not running, so the canonical
//! state is `ACTIVE` or `PAUSED`. Leasing and unleasing need no backend
//! work.

use crate::config::VirtualBoxConfig;
use crate::error::{Error, Result};
use crate::poll::PollingWaiter;
use crate::process::{args, run_checked, CommandOutput, CommandRunner};
use crate::vm::backend::resolve_host;
use crate::vm::{CanonicalState, HypervisorAdapter, VmContext};
use async_trait::async_trait;
use leasepool_protocol::OpResult;
use std::sync::Arc;
use std::time::Duration;

/// Output fragment printed when a snapshot name does not exist.
const SNAPSHOT_MISSING: &str = "Could not find a snapshot";

/// Local VirtualBox adapter.
#[derive(Debug)]
pub struct VirtualBoxAdapter {
    name: String,
    program: String,
    domain: String,
    timeout: Duration,
    poll_interval: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl VirtualBoxAdapter {
    /// Adapter for binding `name`.
    pub fn new(name: &str, config: &VirtualBoxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: name.to_string(),
            program: config.program(),
            domain: config.domain.clone(),
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            runner,
        }
    }

    async fn vboxmanage(&self, argv: Vec<String>) -> Result<CommandOutput> {
        run_checked(self.runner.as_ref(), &self.program, &argv, &[]).await
    }

    async fn running(&self, vm: &str) -> Result<bool> {
        let out = self.vboxmanage(args(["list", "runningvms"])).await?;
        Ok(out.stdout.contains(&format!("\"{}\"", vm)))
    }

    async fn query_state(&self, vm: &str) -> Result<CanonicalState> {
        Ok(if self.running(vm).await? {
            CanonicalState::Active
        } else {
            CanonicalState::Paused
        })
    }

    async fn wait_for(&self, vm: &str, desired: CanonicalState) -> Result<CanonicalState> {
        PollingWaiter::new(vm, desired, self.timeout)
            .interval(self.poll_interval)
            .wait(|| self.query_state(vm))
            .await
    }

    async fn snapshot_command(&self, vm: &str, argv: Vec<String>, snapshot: &str) -> Result<()> {
        match self.vboxmanage(argv).await {
            Err(Error::CommandFailed { message, .. }) if message.contains(SNAPSHOT_MISSING) => {
                Err(Error::SnapshotNotFound {
                    vm: vm.to_string(),
                    snapshot: snapshot.to_string(),
                })
            }
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl HypervisorAdapter for VirtualBoxAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "virtualbox"
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
        self.vboxmanage(args(["startvm", vm, "--type", "headless"]))
            .await?;
        self.wait_for(vm, CanonicalState::Active).await?;
        tracing::info!(vm = %vm, hypervisor = %self.name, "vm started");
        Ok(OpResult::ok(format!("Started VM {}.", vm)))
    }

    async fn stop_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        if !self.running(vm).await? {
            return Ok(OpResult::ok(format!("VM {} is not active.", vm)));
        }
        self.vboxmanage(args(["controlvm", vm, "savestate"])).await?;
        self.wait_for(vm, CanonicalState::Paused).await?;
        tracing::info!(vm = %vm, hypervisor = %self.name, "vm state saved");
        Ok(OpResult::ok(format!("Stopped VM {}.", vm)))
    }

    async fn restore_vm(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        if self.running(vm).await? {
            return Err(Error::invalid_state("stopped", CanonicalState::Active));
        }
        self.snapshot_command(vm, args(["snapshot", vm, "restore", snapshot]), snapshot)
            .await?;
        Ok(OpResult::ok(format!(
            "Restored VM {} to snapshot {}.",
            vm, snapshot
        )))
    }

    async fn take_snapshot(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.vboxmanage(args(["snapshot", vm, "take", snapshot]))
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
        self.snapshot_command(vm, args(["snapshot", vm, "edit", src, "--name", dst]), src)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::ScriptedRunner;

    const RUNNING: &str = "\"vm1\" {4ec0d9a6-0000-0000-0000-000000000001}\n";

    fn adapter(runner: Arc<ScriptedRunner>) -> VirtualBoxAdapter {
        let config = VirtualBoxConfig {
            program: Some("vboxmanage".into()),
            ..Default::default()
        };
        VirtualBoxAdapter::new("vbox1", &config, runner)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_on_running_vm_issues_no_startvm() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("vboxmanage list runningvms", vec![CommandOutput::ok(RUNNING)]);
        let vbox = adapter(runner.clone());

        let result = vbox.start_vm("vm1", "master", &VmContext::default()).await.unwrap();

        assert!(result.msg.contains("already started"));
        assert_eq!(runner.count("vboxmanage startvm"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_until_listed_as_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "vboxmanage list runningvms",
            vec![
                CommandOutput::ok(""),
                CommandOutput::ok(""),
                CommandOutput::ok(RUNNING),
            ],
        );
        let vbox = adapter(runner.clone());

        vbox.start_vm("vm1", "master", &VmContext::default()).await.unwrap();

        assert_eq!(runner.count("vboxmanage startvm vm1 --type headless"), 1);
        assert_eq!(runner.count("vboxmanage list runningvms"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_when_vm_never_runs() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("vboxmanage list runningvms", vec![CommandOutput::ok("")]);
        let vbox = adapter(runner);

        let err = vbox
            .start_vm("vm1", "master", &VmContext::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_restore_refused_while_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("vboxmanage list runningvms", vec![CommandOutput::ok(RUNNING)]);
        let vbox = adapter(runner.clone());

        let err = vbox
            .restore_vm("vm1", "master", &VmContext::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(runner.count("vboxmanage snapshot"), 0);
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "vboxmanage snapshot vm1 restore",
            vec![CommandOutput::failed(
                "VBoxManage: error: Could not find a snapshot named 'golden'",
            )],
        );
        let vbox = adapter(runner);

        let err = vbox
            .restore_vm("vm1", "golden", &VmContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn test_error_text_on_clean_exit_fails_stop() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on("vboxmanage list runningvms", vec![CommandOutput::ok(RUNNING)])
            .on(
                "vboxmanage controlvm",
                vec![CommandOutput::ok("ERROR: machine is locked")],
            );
        let vbox = adapter(runner);

        let err = vbox.stop_vm("vm1", &VmContext::default()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_rename_snapshot_command() {
        let runner = Arc::new(ScriptedRunner::new());
        let vbox = adapter(runner.clone());
        vbox.rename_snapshot("vm1", "master", "old-1", &VmContext::default())
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["vboxmanage snapshot vm1 edit master --name old-1"]
        );
    }
}
