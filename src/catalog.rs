//! Device and user catalogs.
//!
//! The catalog is read at start-up and on an explicit reload. Only the
//! administrative add/remove operations write it back.

use crate::error::{Error, Result};
use crate::store::JsonFile;
use leasepool_protocol::{Device, User};
use std::path::Path;

/// Devices file name inside the data directory.
pub const DEVICES_FILE: &str = "devices.json";

/// Users file name inside the data directory.
pub const USERS_FILE: &str = "users.json";

/// In-memory device and user tables with their backing files.
#[derive(Debug)]
pub struct Catalog {
    devices: Vec<Device>,
    users: Vec<User>,
    device_store: JsonFile,
    user_store: JsonFile,
}

impl Catalog {
    /// Load both tables from `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let device_store = JsonFile::new(data_dir.join(DEVICES_FILE));
        let user_store = JsonFile::new(data_dir.join(USERS_FILE));
        let devices: Vec<Device> = device_store.load_or_default()?;
        let users: Vec<User> = user_store.load_or_default()?;
        tracing::info!(
            devices = devices.len(),
            users = users.len(),
            "catalog loaded"
        );
        Ok(Self {
            devices,
            users,
            device_store,
            user_store,
        })
    }

    /// Re-read both tables, replacing the in-memory copies only if both
    /// parse.
    pub fn reload(&mut self) -> Result<()> {
        let devices: Vec<Device> = self.device_store.load_or_default()?;
        let users: Vec<User> = self.user_store.load_or_default()?;
        tracing::info!(
            devices = devices.len(),
            users = users.len(),
            "catalog reloaded"
        );
        self.devices = devices;
        self.users = users;
        Ok(())
    }

    /// All devices in catalog order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Look up a device by name.
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Look up a device, failing if absent.
    pub fn require_device(&self, name: &str) -> Result<&Device> {
        self.device(name)
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    /// Look up a user by identity.
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Look up a user, failing if unknown.
    pub fn require_user(&self, name: &str) -> Result<&User> {
        self.user(name)
            .ok_or_else(|| Error::UnknownUser(name.to_string()))
    }

    /// Append a device and persist.
    pub fn add_device(&mut self, device: Device) -> Result<()> {
        if device.name.trim().is_empty() {
            return Err(Error::Config("device name must not be empty".into()));
        }
        if self.device(&device.name).is_some() {
            return Err(Error::DeviceExists(device.name));
        }
        tracing::info!(device = %device.name, "adding device to catalog");
        let mut next = self.devices.clone();
        next.push(device);
        self.device_store.save(&next)?;
        self.devices = next;
        Ok(())
    }

    /// Remove a device and persist.
    pub fn remove_device(&mut self, name: &str) -> Result<Device> {
        let index = self
            .devices
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))?;
        let mut next = self.devices.clone();
        let removed = next.remove(index);
        self.device_store.save(&next)?;
        self.devices = next;
        tracing::info!(device = %name, "removed device from catalog");
        Ok(removed)
    }
}

/// Whether every item of the comma-separated `wanted` list appears in the
/// comma-separated `have` list. An empty `wanted` matches anything.
pub fn contains_all(have: &str, wanted: &str) -> bool {
    if wanted.trim().is_empty() {
        return true;
    }
    let have: Vec<&str> = have.split(',').map(str::trim).collect();
    wanted
        .split(',')
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .all(|w| have.contains(&w))
}
