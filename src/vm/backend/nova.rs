//! [`ComputeApi`] over the `nova` CLI and a floating-address helper.
//!
//! Only exit status decides success here: `nova list` prints every
//! tenant instance, so an unrelated instance in `ERROR` must not fail
//! the call.

use crate::config::OpenStackConfig;
use crate::error::{Error, Result};
use crate::process::{args, display_command, CommandOutput, CommandRunner};
use crate::vm::backend::ComputeApi;
use crate::vm::CanonicalState;
use async_trait::async_trait;
use std::sync::Arc;

/// Marker on the helper's `displayassociated` response line.
const ASSOCIATED_MARKER: &str = "OPSTX7832I";

/// CLI-backed compute API.
#[derive(Debug)]
pub struct NovaCli {
    nova: String,
    helper: String,
    helper_args: Vec<String>,
    key_name: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl NovaCli {
    /// Client using the programs named in `config`.
    pub fn new(config: &OpenStackConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            nova: config.nova_program.clone(),
            helper: config.floating_ip_program.clone(),
            helper_args: config.floating_ip_args.clone(),
            key_name: config.key_name.clone().filter(|k| !k.is_empty()),
            runner,
        }
    }

    async fn exec(&self, program: &str, argv: Vec<String>) -> Result<CommandOutput> {
        let output = self.runner.run(program, &argv).await?;
        if output.status != Some(0) {
            return Err(Error::command_failed(
                display_command(program, &argv),
                output.summary(),
            ));
        }
        Ok(output)
    }

    async fn nova(&self, argv: Vec<String>) -> Result<CommandOutput> {
        self.exec(&self.nova, argv).await
    }

    async fn helper(&self, operation: &str, vm: &str) -> Result<CommandOutput> {
        let mut argv = self.helper_args.clone();
        argv.push(operation.to_string());
        argv.push(vm.to_string());
        self.exec(&self.helper, argv).await
    }
}

/// Map `vm`'s row of `nova list` output onto a canonical state.
fn parse_list(output: &str, vm: &str) -> CanonicalState {
    let needle = format!(" {} ", vm);
    let Some(row) = output.lines().find(|line| line.contains(&needle)) else {
        return CanonicalState::NonExistent;
    };
    if row.contains("ACTIVE") {
        CanonicalState::Active
    } else if row.contains("PAUSED") {
        CanonicalState::Paused
    } else if row.contains("BUILD") {
        CanonicalState::Build
    } else if row.contains("ERROR") {
        CanonicalState::Error
    } else {
        CanonicalState::Unrecognized
    }
}

/// Pull the address out of the helper's JSON response line.
fn parse_associated(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains(ASSOCIATED_MARKER))?;
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value
        .get("ip")
        .and_then(|ip| ip.as_str())
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ComputeApi for NovaCli {
    async fn state(&self, vm: &str) -> Result<CanonicalState> {
        let out = self.nova(args(["list"])).await?;
        let state = parse_list(&out.stdout, vm);
        tracing::debug!(vm = %vm, state = %state, "nova list");
        Ok(state)
    }

    async fn boot(&self, vm: &str, flavor: &str, image: &str) -> Result<()> {
        let mut argv = args(["boot", "--flavor", flavor, "--image", image]);
        if let Some(key) = &self.key_name {
            argv.push("--key_name".to_string());
            argv.push(key.clone());
        }
        argv.push(vm.to_string());
        self.nova(argv).await.map(|_| ())
    }

    async fn delete(&self, vm: &str) -> Result<()> {
        self.nova(args(["delete", vm])).await.map(|_| ())
    }

    async fn pause(&self, vm: &str) -> Result<()> {
        self.nova(args(["pause", vm])).await.map(|_| ())
    }

    async fn unpause(&self, vm: &str) -> Result<()> {
        self.nova(args(["unpause", vm])).await.map(|_| ())
    }

    async fn associate(&self, vm: &str) -> Result<()> {
        self.helper("associate", vm).await.map(|_| ())
    }

    async fn deassociate(&self, vm: &str) -> Result<()> {
        self.helper("deassociate", vm).await.map(|_| ())
    }

    async fn associated_ip(&self, vm: &str) -> Result<Option<String>> {
        let out = self.helper("displayassociated", vm).await?;
        Ok(parse_associated(&out.stdout))
    }
}
