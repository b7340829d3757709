//! Per-device snapshot bindings.
//!
//! A device restores to its bound snapshot, `master` unless rebound.

use crate::error::{Error, Result};
use crate::store::JsonFile;
use std::collections::BTreeMap;
use std::path::Path;

/// Snapshot file name inside the data directory.
pub const SNAPSHOTS_FILE: &str = "snapshots.json";

/// Snapshot a device restores to unless rebound.
pub const DEFAULT_SNAPSHOT: &str = "master";

/// Shortest accepted snapshot name.
pub const MIN_NAME_LEN: usize = 3;

/// Longest accepted snapshot name.
pub const MAX_NAME_LEN: usize = 64;

/// Device name → snapshot designator.
#[derive(Debug)]
pub struct SnapshotBindings {
    bindings: BTreeMap<String, String>,
    store: JsonFile,
}

impl SnapshotBindings {
    /// Load bindings from `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = JsonFile::new(data_dir.join(SNAPSHOTS_FILE));
        let bindings = store.load_or_default()?;
        Ok(Self { bindings, store })
    }

    /// Snapshot bound to `device`.
    pub fn name(&self, device: &str) -> &str {
        self.bindings
            .get(device)
            .map_or(DEFAULT_SNAPSHOT, String::as_str)
    }

    /// Bind `device` to `snapshot` and persist.
    pub fn bind(&mut self, device: &str, snapshot: &str) -> Result<()> {
        validate_name(snapshot)?;
        let mut next = self.bindings.clone();
        next.insert(device.to_string(), snapshot.to_string());
        self.store.save(&next)?;
        self.bindings = next;
        tracing::info!(device = %device, snapshot = %snapshot, "snapshot binding changed");
        Ok(())
    }
}

/// Reject names outside the accepted length range or with whitespace.
pub fn validate_name(snapshot: &str) -> Result<()> {
    let len = snapshot.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(Error::InvalidSnapshotName(format!(
            "'{}' must be {} to {} characters",
            snapshot, MIN_NAME_LEN, MAX_NAME_LEN
        )));
    }
    if snapshot.chars().any(char::is_whitespace) {
        return Err(Error::InvalidSnapshotName(format!(
            "'{}' must not contain whitespace",
            snapshot
        )));
    }
    Ok(())
}

/// Archive name for a snapshot replaced at `now`.
pub fn archive_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("old-{}", now.format("%Y-%m%d-%H%M-%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_device_uses_master() {
        let dir = tempfile::tempdir().unwrap();
        let bindings = SnapshotBindings::open(dir.path()).unwrap();
        assert_eq!(bindings.name("vm1"), "master");
    }

    #[test]
    fn test_bind_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut bindings = SnapshotBindings::open(dir.path()).unwrap();
        bindings.bind("vm1", "golden-2024").unwrap();

        let reopened = SnapshotBindings::open(dir.path()).unwrap();
        assert_eq!(reopened.name("vm1"), "golden-2024");
        assert_eq!(reopened.name("vm2"), "master");
    }

    #[test]
    fn test_name_length_limits() {
        assert!(validate_name("ab").is_err());
        assert!(validate_name("abc").is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("has space").is_err());
    }

    #[test]
    fn test_rejected_bind_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut bindings = SnapshotBindings::open(dir.path()).unwrap();
        bindings.bind("vm1", "golden").unwrap();
        assert!(bindings.bind("vm1", "x").is_err());
        assert_eq!(bindings.name("vm1"), "golden");
    }

    #[test]
    fn test_failed_write_keeps_previous_binding() {
        let dir = tempfile::tempdir().unwrap();
        let mut bindings = SnapshotBindings::open(dir.path()).unwrap();
        bindings.bind("vm1", "golden").unwrap();

        let path = dir.path().join(SNAPSHOTS_FILE);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(bindings.bind("vm1", "silver").is_err());
        assert_eq!(bindings.name("vm1"), "golden");
    }

    #[test]
    fn test_archive_name_is_valid_snapshot_name() {
        use chrono::TimeZone;
        let now = chrono::Utc.with_ymd_and_hms(2013, 6, 3, 21, 25, 21).unwrap();
        let name = archive_name(now);
        assert_eq!(name, "old-2013-0603-2125-21");
        assert!(validate_name(&name).is_ok());
    }
}
