//! Hypervisor backend implementations.
//!
//! One adapter per configured binding, chosen by the binding's `kind`.

mod nova;
mod openstack;
mod virtualbox;
mod vlaunch;
mod vlaunch_client;
mod vsphere;

use crate::config::{BackendConfig, HypervisorConfig};
use crate::error::Result;
use crate::process::{CommandRunner, TokioCommandRunner, DEFAULT_COMMAND_TIMEOUT};
use crate::sync::ResourceSerializer;
use crate::vm::HypervisorAdapter;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use nova::NovaCli;
pub use openstack::{ComputeApi, OpenStackAdapter, OpenStackTimeouts};
pub use virtualbox::VirtualBoxAdapter;
pub use vlaunch::{
    LaunchService, SnapshotRecord, VLaunchAdapter, VLaunchTimeouts, VmRecord, WorkRequest,
};
pub use vlaunch_client::VLaunchClient;
pub use vsphere::VSphereAdapter;

/// Live adapters keyed by binding name.
pub type AdapterMap = HashMap<String, Arc<dyn HypervisorAdapter>>;

/// Serializer key under which every floating-address association runs.
pub const FLOATING_IP_KEY: &str = "floating-ip";

/// Collaborators shared by every adapter built from one configuration.
#[derive(Debug, Clone)]
pub struct SharedResources {
    /// Process execution for CLI-driven backends.
    pub runner: Arc<dyn CommandRunner>,
    /// Serializes floating-address association across cloud bindings.
    pub floating_ips: Arc<ResourceSerializer>,
}

impl SharedResources {
    /// Resources whose external commands are killed after `command_timeout`.
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            runner: Arc::new(TokioCommandRunner::new(command_timeout)),
            floating_ips: Arc::new(ResourceSerializer::new("floating-ip")),
        }
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

/// Build the adapter for one binding.
pub fn create(
    binding: &HypervisorConfig,
    shared: &SharedResources,
) -> Result<Arc<dyn HypervisorAdapter>> {
    let adapter: Arc<dyn HypervisorAdapter> = match &binding.backend {
        BackendConfig::VirtualBox(config) => Arc::new(VirtualBoxAdapter::new(
            &binding.name,
            config,
            shared.runner.clone(),
        )),
        BackendConfig::VSphere(config) => Arc::new(VSphereAdapter::from_config(
            &binding.name,
            config,
            shared.runner.clone(),
        )?),
        BackendConfig::OpenStack(config) => Arc::new(OpenStackAdapter::new(
            &binding.name,
            Arc::new(NovaCli::new(config, shared.runner.clone())),
            shared.floating_ips.clone(),
            config.default_flavor.clone(),
            OpenStackTimeouts::from(config),
        )),
        BackendConfig::VLaunch(config) => {
            Arc::new(VLaunchAdapter::from_config(&binding.name, config)?)
        }
    };
    tracing::info!(
        hypervisor = %binding.name,
        kind = binding.backend.kind(),
        "hypervisor adapter ready"
    );
    Ok(adapter)
}

/// Build adapters for every binding.
pub fn create_all(bindings: &[HypervisorConfig], shared: &SharedResources) -> Result<AdapterMap> {
    bindings
        .iter()
        .map(|binding| Ok((binding.name.clone(), create(binding, shared)?)))
        .collect()
}

/// Resolve `<vm>.<domain>` (or `vm` when no domain is configured),
/// preferring IPv4. Lookup failure yields `None`.
pub(crate) async fn resolve_host(vm: &str, domain: &str) -> Option<String> {
    let host = if domain.is_empty() {
        vm.to_string()
    } else {
        format!("{}.{}", vm, domain.trim_start_matches('.'))
    };
    // Bound to a local so the lookup future is dropped before `host`.
    let resolved = match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            let chosen = addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .map(ToString::to_string);
            if chosen.is_none() {
                tracing::debug!(host = %host, "lookup returned no addresses");
            }
            chosen
        }
        Err(e) => {
            tracing::debug!(host = %host, error = %e, "did not find address");
            None
        }
    };
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_create_all_builds_cli_backends() {
        let config = ServerConfig::parse(
            r#"
            [[hypervisors]]
            name = "vbox1"
            kind = "virtualbox"

            [[hypervisors]]
            name = "cloud1"
            kind = "openstack"
            "#,
        )
        .unwrap();
        let adapters = create_all(&config.hypervisors, &SharedResources::default()).unwrap();
        assert_eq!(adapters["vbox1"].kind(), "virtualbox");
        assert_eq!(adapters["cloud1"].kind(), "openstack");
        assert_eq!(adapters["cloud1"].name(), "cloud1");
    }

    #[test]
    fn test_vsphere_without_password_is_config_error() {
        let config = ServerConfig::parse(
            r#"
            [[hypervisors]]
            name = "vc1"
            kind = "vsphere"
            env_password = "LEASEPOOL_TEST_UNSET_PASSWORD"
            "#,
        )
        .unwrap();
        let err = create_all(&config.hypervisors, &SharedResources::default()).unwrap_err();
        assert!(err.to_string().contains("LEASEPOOL_TEST_UNSET_PASSWORD"));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let ip = resolve_host("localhost", "").await;
        assert!(ip.is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_host_yields_none() {
        assert_eq!(resolve_host("leasepool-vm", ".invalid").await, None);
    }
}
