//! leasepool - device and VM lease orchestrator.
//!
//! Users lease devices from a shared catalog. Virtual devices are driven
//! through a uniform lifecycle contract implemented once per hypervisor
//! backend:
//!
//! - [`pool::Pool`]: the orchestration facade (lease, unlease, start, stop,
//!   restore, snapshots, status)
//! - [`vm::HypervisorAdapter`]: the backend contract and its
//!   VirtualBox, vSphere, OpenStack and vLaunch implementations
//! - [`api`]: the REST surface
//! - [`supervisor`]: the lease-expiry reminder task

pub mod activity;
pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lease;
pub mod notify;
pub mod poll;
pub mod pool;
pub mod process;
pub mod snapshots;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod vm;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
