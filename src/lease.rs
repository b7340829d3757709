//! Lease records and expiry tracking.
//!
//! One [`Lease`] per device name, created lazily as available/unleased.
//! Mutations are persisted to `leases.json` before returning.

use crate::error::{Error, Result};
use crate::store::JsonFile;
use chrono::{DateTime, Utc};
use leasepool_protocol::{User, UNLEASED};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Lease file name inside the data directory.
pub const LEASES_FILE: &str = "leases.json";

/// Lease state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// "true" while nobody holds the device.
    #[serde(with = "bool_string")]
    pub available: bool,
    /// Holder identity, or [`UNLEASED`].
    pub lessor: String,
    /// When the current lease began.
    #[serde(
        rename = "leaseTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub leased_at: Option<DateTime<Utc>>,
    /// When the holder was last told the lease expired.
    #[serde(
        rename = "lastNotifiedTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_notified: Option<DateTime<Utc>>,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            available: true,
            lessor: UNLEASED.to_string(),
            leased_at: None,
            last_notified: None,
        }
    }
}

impl Lease {
    /// Whether someone holds the device.
    pub fn is_leased(&self) -> bool {
        !self.available
    }

    /// Holder identity while leased.
    pub fn holder(&self) -> Option<&str> {
        self.is_leased().then_some(self.lessor.as_str())
    }

    /// Whether the lease is older than `max`.
    pub fn is_expired(&self, max: Duration, now: DateTime<Utc>) -> bool {
        match (self.is_leased(), self.leased_at) {
            (true, Some(since)) => elapsed(since, now) > max,
            _ => false,
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// An expired lease whose holder is due a reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryNotice {
    /// Device name.
    pub device: String,
    /// Current holder.
    pub lessor: String,
    /// When the lease began.
    pub leased_at: DateTime<Utc>,
}

/// All lease records.
#[derive(Debug)]
pub struct LeaseRegistry {
    leases: BTreeMap<String, Lease>,
    store: JsonFile,
}

impl LeaseRegistry {
    /// Load leases from `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = JsonFile::new(data_dir.join(LEASES_FILE));
        let leases: BTreeMap<String, Lease> = store.load_or_default()?;
        for (device, lease) in &leases {
            if lease.is_leased() && lease.lessor == UNLEASED {
                return Err(Error::storage(
                    store.path(),
                    format!("device {} marked leased without a lessor", device),
                ));
            }
        }
        Ok(Self { leases, store })
    }

    /// Snapshot of the record for `device` without creating it.
    pub fn peek(&self, device: &str) -> Lease {
        self.leases.get(device).cloned().unwrap_or_default()
    }

    /// Whether `device` can be leased.
    pub fn is_available(&self, device: &str) -> bool {
        self.leases.get(device).map_or(true, |l| l.available)
    }

    /// Current holder of `device`.
    pub fn lessor_of(&self, device: &str) -> Option<&str> {
        self.leases.get(device).and_then(Lease::holder)
    }

    /// Grant `device` to `lessor`.
    pub fn lease(&mut self, device: &str, lessor: &User, now: DateTime<Utc>) -> Result<()> {
        if lessor.name.is_empty() || lessor.name == UNLEASED {
            return Err(Error::UnknownUser(lessor.name.clone()));
        }
        if let Some(holder) = self.lessor_of(device) {
            return Err(Error::AlreadyLeased {
                device: device.to_string(),
                lessor: holder.to_string(),
            });
        }
        let mut next = self.leases.clone();
        next.insert(
            device.to_string(),
            Lease {
                available: false,
                lessor: lessor.name.clone(),
                leased_at: Some(now),
                last_notified: None,
            },
        );
        self.commit(next)?;
        tracing::debug!(device = %device, lessor = %lessor.name, "lease recorded");
        Ok(())
    }

    /// Release `device`, returning the record as it was.
    pub fn unlease(&mut self, device: &str) -> Result<Lease> {
        let previous = self.peek(device);
        if !previous.is_leased() {
            return Err(Error::NotLeased(device.to_string()));
        }
        let mut next = self.leases.clone();
        next.insert(device.to_string(), Lease::default());
        self.commit(next)?;
        tracing::debug!(device = %device, lessor = %previous.lessor, "lease released");
        Ok(previous)
    }

    /// Drop the record of a device that left the catalog.
    pub fn forget(&mut self, device: &str) -> Result<()> {
        if !self.leases.contains_key(device) {
            return Ok(());
        }
        let mut next = self.leases.clone();
        next.remove(device);
        self.commit(next)
    }

    /// Expired leases whose holder has not been reminded within
    /// `renotify_after`. Each returned lease is stamped as notified at
    /// `now`.
    pub fn due_notices(
        &mut self,
        now: DateTime<Utc>,
        max: Duration,
        renotify_after: Duration,
    ) -> Result<Vec<ExpiryNotice>> {
        let mut next = self.leases.clone();
        let mut due = Vec::new();
        for (device, lease) in next.iter_mut() {
            if !lease.is_expired(max, now) {
                continue;
            }
            let recently_notified = lease
                .last_notified
                .is_some_and(|at| elapsed(at, now) < renotify_after);
            if recently_notified {
                continue;
            }
            lease.last_notified = Some(now);
            if let Some(leased_at) = lease.leased_at {
                due.push(ExpiryNotice {
                    device: device.clone(),
                    lessor: lease.lessor.clone(),
                    leased_at,
                });
            }
        }
        if !due.is_empty() {
            self.commit(next)?;
        }
        Ok(due)
    }

    /// Persist `next`, then make it current. A failed write leaves the
    /// in-memory records untouched.
    fn commit(&mut self, next: BTreeMap<String, Lease>) -> Result<()> {
        self.store.save(&next)?;
        self.leases = next;
        Ok(())
    }
}

/// Serde adapter for the "true"/"false" string encoding.
mod bool_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(de::Error::custom(format!(
                "expected \"true\" or \"false\", got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(name: &str) -> User {
        User {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_lease_then_unlease() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();

        assert!(registry.is_available("d1"));
        registry.lease("d1", &user("alice"), t0()).unwrap();
        assert!(!registry.is_available("d1"));
        assert_eq!(registry.lessor_of("d1"), Some("alice"));

        let previous = registry.unlease("d1").unwrap();
        assert_eq!(previous.lessor, "alice");
        assert!(registry.is_available("d1"));
        assert_eq!(registry.peek("d1"), Lease::default());
    }

    #[test]
    fn test_double_lease_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();
        registry.lease("d1", &user("alice"), t0()).unwrap();
        let err = registry.lease("d1", &user("bob"), t0()).unwrap_err();
        assert!(matches!(err, Error::AlreadyLeased { ref lessor, .. } if lessor == "alice"));
    }

    #[test]
    fn test_second_unlease_is_not_leased_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();
        registry.lease("d1", &user("alice"), t0()).unwrap();
        registry.unlease("d1").unwrap();
        assert!(matches!(registry.unlease("d1"), Err(Error::NotLeased(_))));
    }

    #[test]
    fn test_leases_survive_reopen_with_string_booleans() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut registry = LeaseRegistry::open(dir.path()).unwrap();
            registry.lease("d1", &user("alice"), t0()).unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join(LEASES_FILE)).unwrap();
        assert!(raw.contains("\"available\": \"false\""));

        let registry = LeaseRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.lessor_of("d1"), Some("alice"));
    }

    #[test]
    fn test_expiry() {
        let max = Duration::from_secs(7 * 86400);
        let mut lease = Lease::default();
        assert!(!lease.is_expired(max, t0()));

        lease.available = false;
        lease.lessor = "alice".into();
        lease.leased_at = Some(t0());
        assert!(!lease.is_expired(max, t0() + chrono::Duration::days(7)));
        assert!(lease.is_expired(max, t0() + chrono::Duration::days(7) + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_hourly_sweep_for_a_week_notifies_at_most_daily() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();
        let max = Duration::from_secs(3600);
        let renotify = Duration::from_secs(86400);
        registry.lease("d1", &user("alice"), t0()).unwrap();

        let mut notices = Vec::new();
        for hour in 0..(24 * 7) {
            let now = t0() + chrono::Duration::hours(hour);
            for notice in registry.due_notices(now, max, renotify).unwrap() {
                notices.push(now);
                assert_eq!(notice.lessor, "alice");
            }
        }

        assert_eq!(notices.len(), 7);
        for pair in notices.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::hours(24));
        }
    }

    #[test]
    fn test_unlease_clears_notification_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();
        let max = Duration::from_secs(60);
        registry.lease("d1", &user("alice"), t0()).unwrap();
        let later = t0() + chrono::Duration::hours(1);
        assert_eq!(registry.due_notices(later, max, Duration::from_secs(86400)).unwrap().len(), 1);

        registry.unlease("d1").unwrap();
        registry.lease("d1", &user("bob"), later).unwrap();
        let even_later = later + chrono::Duration::hours(1);
        let due = registry.due_notices(even_later, max, Duration::from_secs(86400)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].lessor, "bob");
    }

    #[test]
    fn test_failed_write_leaves_records_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LeaseRegistry::open(dir.path()).unwrap();
        registry.lease("d1", &user("alice"), t0()).unwrap();

        // A directory in place of the file makes the rename fail.
        std::fs::remove_file(dir.path().join(LEASES_FILE)).unwrap();
        std::fs::create_dir(dir.path().join(LEASES_FILE)).unwrap();

        assert!(matches!(
            registry.lease("d2", &user("bob"), t0()),
            Err(Error::Storage { .. })
        ));
        assert!(registry.is_available("d2"));

        assert!(registry.unlease("d1").is_err());
        assert_eq!(registry.lessor_of("d1"), Some("alice"));

        let later = t0() + chrono::Duration::days(30);
        let week = Duration::from_secs(7 * 86400);
        assert!(registry.due_notices(later, week, week).is_err());
        assert_eq!(registry.peek("d1").last_notified, None);
    }
}
