//! Server configuration.
//!
//! Loaded once at start-up from a TOML file. Every field has a default so a
//! missing file yields a usable (if backend-less) server. Hypervisor
//! bindings are a closed set of backend kinds selected by the `kind` tag.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for the default data directory.
const APP_NAME: &str = "leasepool";

/// Default configuration file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "leasepool.toml";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port the REST surface listens on.
    pub listen: String,

    /// URL prefix for every route (e.g. `pool` → `/pool/devices/...`).
    pub context_root: String,

    /// Directory holding the JSON catalog, lease, and snapshot stores.
    pub data_dir: PathBuf,

    /// Identity copied on every lease notification.
    pub admin_user: String,

    /// Only identity allowed to take or rename snapshots.
    pub update_user: String,

    /// Lease duration and expiry sweep policy.
    pub lease: LeasePolicy,

    /// How notifications are delivered.
    pub notifier: NotifierConfig,

    /// Longest any external command (CLI backends, ping) may run.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Hypervisor bindings, keyed by `name`.
    pub hypervisors: Vec<HypervisorConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7890".to_string(),
            context_root: "pool".to_string(),
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME),
            admin_user: "admin".to_string(),
            update_user: "update-robot".to_string(),
            lease: LeasePolicy::default(),
            notifier: NotifierConfig::default(),
            command_timeout: crate::process::DEFAULT_COMMAND_TIMEOUT,
            hypervisors: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::ConfigLoad {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        let config = Self::parse(&text).map_err(|e| match e {
            Error::Config(message) => Error::ConfigLoad {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.context_root.contains('/') || self.context_root.is_empty() {
            return Err(Error::Config(format!(
                "context_root must be a single path segment, got '{}'",
                self.context_root
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for binding in &self.hypervisors {
            if !seen.insert(binding.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate hypervisor name '{}'",
                    binding.name
                )));
            }
        }
        if self.lease.sweep_interval.is_zero() {
            return Err(Error::Config("lease.sweep_interval must be non-zero".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::Config("command_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Lease duration and expiry notification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasePolicy {
    /// Leases older than this are expired.
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,

    /// How often the expiry sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Minimum gap between two notices for the same expired lease.
    #[serde(with = "humantime_serde")]
    pub renotify_after: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            renotify_after: Duration::from_secs(24 * 3600),
        }
    }
}

/// Notification delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    /// Write notices to the log only.
    #[default]
    Log,
    /// Pipe each notice to an external mailer program.
    Command {
        /// Program to run; recipients are appended as arguments.
        program: String,
        /// Fixed leading arguments (e.g. `["-s", "{subject}"]`).
        #[serde(default)]
        args: Vec<String>,
    },
}

/// One hypervisor binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Binding name referenced by devices.
    pub name: String,
    /// Backend kind and its settings.
    #[serde(flatten)]
    pub backend: BackendConfig,
}

/// Closed set of supported backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local VirtualBox via its management CLI.
    VirtualBox(VirtualBoxConfig),
    /// vSphere via the Perl toolkit scripts.
    VSphere(VSphereConfig),
    /// OpenStack via the nova CLI and a floating-IP helper.
    OpenStack(OpenStackConfig),
    /// Internal launch service over HTTP.
    VLaunch(VLaunchConfig),
}

impl BackendConfig {
    /// Backend kind as written in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::VirtualBox(_) => "virtualbox",
            BackendConfig::VSphere(_) => "vsphere",
            BackendConfig::OpenStack(_) => "openstack",
            BackendConfig::VLaunch(_) => "vlaunch",
        }
    }
}

/// VirtualBox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualBoxConfig {
    /// Management CLI; defaults per platform.
    pub program: Option<String>,
    /// DNS domain appended to VM names for address lookup.
    pub domain: String,
    /// Bound on start/stop state changes.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sampling interval while waiting.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for VirtualBoxConfig {
    fn default() -> Self {
        Self {
            program: None,
            domain: String::new(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl VirtualBoxConfig {
    /// The CLI name: `VBoxManage` on macOS, `vboxmanage` elsewhere.
    pub fn program(&self) -> String {
        self.program.clone().unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                "VBoxManage".to_string()
            } else {
                "vboxmanage".to_string()
            }
        })
    }
}

/// vSphere toolkit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VSphereConfig {
    /// vCenter SDK URL.
    pub url: String,
    /// Toolkit login.
    pub username: String,
    /// Name of the environment variable holding the password.
    pub env_password: String,
    /// DNS domain appended to VM names for address lookup.
    pub domain: String,
    /// Directory holding the toolkit scripts; empty means `$PATH`.
    pub scripts_dir: Option<PathBuf>,
    /// Bound on power state changes.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sampling interval while waiting.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for VSphereConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            env_password: "VSPHERE_PASSWORD".to_string(),
            domain: String::new(),
            scripts_dir: None,
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(3456),
        }
    }
}

/// OpenStack settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
    /// nova CLI.
    pub nova_program: String,
    /// Floating-IP helper program (`associate|deassociate|displayassociated <vm>`).
    pub floating_ip_program: String,
    /// Leading arguments for the helper (e.g. the script path for an interpreter).
    pub floating_ip_args: Vec<String>,
    /// Flavor used when a device does not name one.
    pub default_flavor: String,
    /// Keypair injected at boot, if any.
    pub key_name: Option<String>,
    /// Pause after boot before polling starts.
    #[serde(with = "humantime_serde")]
    pub boot_settle: Duration,
    /// Bound on BUILD → ACTIVE.
    #[serde(with = "humantime_serde")]
    pub active_timeout: Duration,
    /// Bound on ACTIVE → PAUSED.
    #[serde(with = "humantime_serde")]
    pub pause_timeout: Duration,
    /// Bound on delete → NON_EXISTENT.
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
    /// Sampling interval while waiting.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            nova_program: "nova".to_string(),
            floating_ip_program: "python".to_string(),
            floating_ip_args: vec!["opstx.py".to_string()],
            default_flavor: "m1.medium".to_string(),
            key_name: None,
            boot_settle: Duration::from_millis(6789),
            active_timeout: Duration::from_secs(360),
            pause_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_millis(34567),
            poll_interval: Duration::from_millis(3456),
        }
    }
}

/// Launch service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VLaunchConfig {
    /// API base URL, e.g. `https://vlaunch.example.com/api/v1`.
    pub url: String,
    /// Name of the environment variable holding the fallback token.
    pub env_token: String,
    /// DNS domain appended to VM names for address lookup.
    pub domain: String,
    /// Accept self-signed service certificates.
    pub accept_invalid_certs: bool,
    /// Per-request HTTP timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Bound on a snapshot revert work request.
    #[serde(with = "humantime_serde")]
    pub restore_timeout: Duration,
    /// Bound on a power-on work request.
    #[serde(with = "humantime_serde")]
    pub power_on_timeout: Duration,
    /// Bound on a power-off work request.
    #[serde(with = "humantime_serde")]
    pub power_off_timeout: Duration,
    /// Sampling interval while waiting.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for VLaunchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            env_token: "VLAUNCH_TOKEN".to_string(),
            domain: String::new(),
            accept_invalid_certs: true,
            request_timeout: Duration::from_secs(30),
            restore_timeout: Duration::from_secs(60),
            power_on_timeout: Duration::from_secs(120),
            power_off_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(3456),
        }
    }
}

/// Read a secret from the environment variable named `var`.
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| {
        Error::Config(format!("please set environment variable {}", var))
    })
}
