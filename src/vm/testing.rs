//! Test doubles for adapters and their collaborators.

use crate::error::{Error, Result};
use crate::process::{display_command, CommandOutput, CommandRunner};
use crate::vm::backend::{ComputeApi, LaunchService, SnapshotRecord, VmRecord, WorkRequest};
use crate::vm::{CanonicalState, HypervisorAdapter, VmContext};
use async_trait::async_trait;
use leasepool_protocol::OpResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Command runner answering from a script keyed by command-line prefix.
///
/// Each rule yields its outputs in order and keeps repeating the last one.
/// Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, prefix: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.rules
            .lock()
            .push((prefix.to_string(), outputs.into_iter().collect()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = display_command(program, args);
        self.calls.lock().push(line.clone());
        let mut rules = self.rules.lock();
        for (prefix, outputs) in rules.iter_mut() {
            if line.starts_with(prefix.as_str()) {
                let output = if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                };
                return Ok(output.unwrap_or_default());
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

/// In-memory adapter with a settable state and a call log.
#[derive(Debug)]
pub struct FakeAdapter {
    name: String,
    state: Mutex<CanonicalState>,
    calls: Mutex<Vec<String>>,
    fail_unlease: Mutex<bool>,
}

impl FakeAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(CanonicalState::Paused),
            calls: Mutex::new(Vec::new()),
            fail_unlease: Mutex::new(false),
        }
    }

    pub fn set_state(&self, state: CanonicalState) {
        *self.state.lock() = state;
    }

    pub fn fail_unlease(&self) {
        *self.fail_unlease.lock() = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl HypervisorAdapter for FakeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn state(&self, _vm: &str, _ctx: &VmContext) -> Result<CanonicalState> {
        Ok(*self.state.lock())
    }

    async fn lease_vm(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.record(format!("lease {vm} {snapshot}"));
        Ok(OpResult::ok("Ok."))
    }

    async fn unlease_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.record(format!("unlease {vm}"));
        if *self.fail_unlease.lock() {
            return Err(Error::backend(&self.name, "teardown failed"));
        }
        Ok(OpResult::ok("Ok."))
    }

    async fn start_vm(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.record(format!("start {vm} {snapshot}"));
        self.set_state(CanonicalState::Active);
        Ok(OpResult::ok(format!("Started VM {vm}")))
    }

    async fn stop_vm(&self, vm: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.record(format!("stop {vm}"));
        self.set_state(CanonicalState::Paused);
        Ok(OpResult::ok(format!("Stopped VM {vm}")))
    }

    async fn restore_vm(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        let state = *self.state.lock();
        if state.is_running() {
            return Err(Error::invalid_state("stopped", state));
        }
        self.record(format!("restore {vm} {snapshot}"));
        Ok(OpResult::ok(format!("Restored VM {vm}")))
    }

    async fn take_snapshot(&self, vm: &str, snapshot: &str, _ctx: &VmContext) -> Result<OpResult> {
        self.record(format!("take {vm} {snapshot}"));
        Ok(OpResult::ok("Took snapshot"))
    }

    async fn rename_snapshot(
        &self,
        vm: &str,
        src: &str,
        dst: &str,
        _ctx: &VmContext,
    ) -> Result<OpResult> {
        self.record(format!("rename {vm} {src} {dst}"));
        Ok(OpResult::ok("Renamed snapshot"))
    }

    async fn get_ip(&self, _vm: &str, _ctx: &VmContext) -> Result<Option<String>> {
        Ok(Some("192.0.2.10".to_string()))
    }
}

/// Compute API answering states from a script and failing chosen calls.
///
/// `state` yields the scripted states in order and repeats the last.
/// Mutating calls are logged as "<op> <vm> [args]".
#[derive(Debug, Default)]
pub struct FakeCompute {
    states: Mutex<VecDeque<CanonicalState>>,
    failing: Mutex<Vec<&'static str>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCompute {
    pub fn with_states(states: &[CanonicalState]) -> Self {
        Self {
            states: Mutex::new(states.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().push(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn call(&self, op: &'static str, line: String) -> Result<()> {
        self.calls.lock().push(line.clone());
        if self.failing.lock().contains(&op) {
            return Err(Error::command_failed(line, format!("{op} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn state(&self, _vm: &str) -> Result<CanonicalState> {
        let mut states = self.states.lock();
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().copied()
        };
        Ok(state.unwrap_or(CanonicalState::NonExistent))
    }

    async fn boot(&self, vm: &str, flavor: &str, image: &str) -> Result<()> {
        self.call("boot", format!("boot {vm} {flavor} {image}"))
    }

    async fn delete(&self, vm: &str) -> Result<()> {
        self.call("delete", format!("delete {vm}"))
    }

    async fn pause(&self, vm: &str) -> Result<()> {
        self.call("pause", format!("pause {vm}"))
    }

    async fn unpause(&self, vm: &str) -> Result<()> {
        self.call("unpause", format!("unpause {vm}"))
    }

    async fn associate(&self, vm: &str) -> Result<()> {
        self.call("associate", format!("associate {vm}"))
    }

    async fn deassociate(&self, vm: &str) -> Result<()> {
        self.call("deassociate", format!("deassociate {vm}"))
    }

    async fn associated_ip(&self, _vm: &str) -> Result<Option<String>> {
        Ok(Some("198.51.100.7".to_string()))
    }
}

/// In-memory launch service.
///
/// Work-request statuses come from a script (last one repeats, default
/// "Completed"). Power actions flip the VM's power state immediately.
/// Every call counts as in flight for the configured latency, and the
/// highest overlap seen is kept.
#[derive(Debug, Default)]
pub struct FakeLaunch {
    vms: Mutex<Vec<VmRecord>>,
    open: Mutex<Vec<WorkRequest>>,
    statuses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
    lists: Mutex<usize>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Marks one [`FakeLaunch`] call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLaunch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vm(&self, id: i64, name: &str, power_state: &str, snapshots: &[(i64, &str)]) {
        self.vms.lock().push(VmRecord {
            id,
            vmname: name.to_string(),
            power_state: power_state.to_string(),
            snapshots: snapshots
                .iter()
                .map(|(id, name)| SnapshotRecord {
                    id: *id,
                    name: name.to_string(),
                })
                .collect(),
        });
    }

    pub fn renumber(&self, name: &str, id: i64) {
        for vm in self.vms.lock().iter_mut().filter(|vm| vm.vmname == name) {
            vm.id = id;
        }
    }

    pub fn open_request(&self, request: WorkRequest) {
        self.open.lock().push(request);
    }

    pub fn script_requests(&self, statuses: &[&str]) {
        *self.statuses.lock() = statuses.iter().map(|s| s.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn list_count(&self) -> usize {
        *self.lists.lock()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Most calls ever observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Record the token and hold the call open for the latency.
    async fn seen(&self, token: &str) -> InFlight<'_> {
        self.tokens.lock().push(token.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn act(&self, call: String, vm_id: i64, power_state: Option<&str>) -> WorkRequest {
        self.calls.lock().push(call);
        if let Some(state) = power_state {
            for vm in self.vms.lock().iter_mut().filter(|vm| vm.id == vm_id) {
                vm.power_state = state.to_string();
            }
        }
        WorkRequest {
            id: 100 + self.calls.lock().len() as i64,
            status: "Pending".to_string(),
        }
    }
}

#[async_trait]
impl LaunchService for FakeLaunch {
    async fn list_vms(&self, token: &str) -> Result<Vec<VmRecord>> {
        let _call = self.seen(token).await;
        *self.lists.lock() += 1;
        Ok(self.vms.lock().clone())
    }

    async fn get_vm(&self, id: i64, token: &str) -> Result<Option<VmRecord>> {
        let _call = self.seen(token).await;
        Ok(self.vms.lock().iter().find(|vm| vm.id == id).cloned())
    }

    async fn get_request(&self, id: i64, token: &str) -> Result<WorkRequest> {
        let _call = self.seen(token).await;
        let mut statuses = self.statuses.lock();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(WorkRequest {
            id,
            status: status.unwrap_or_else(|| "Completed".to_string()),
        })
    }

    async fn open_requests(&self, _vm_id: i64, token: &str) -> Result<Vec<WorkRequest>> {
        let _call = self.seen(token).await;
        Ok(self.open.lock().clone())
    }

    async fn power_on(&self, vm_id: i64, token: &str) -> Result<WorkRequest> {
        let _call = self.seen(token).await;
        Ok(self.act(format!("poweron {vm_id}"), vm_id, Some("poweredOn")))
    }

    async fn force_off(&self, vm_id: i64, token: &str) -> Result<WorkRequest> {
        let _call = self.seen(token).await;
        Ok(self.act(format!("forceoff {vm_id}"), vm_id, Some("poweredOff")))
    }

    async fn revert_snapshot(
        &self,
        vm_id: i64,
        snapshot_id: i64,
        token: &str,
    ) -> Result<WorkRequest> {
        let _call = self.seen(token).await;
        Ok(self.act(format!("revert {vm_id} {snapshot_id}"), vm_id, None))
    }
}
