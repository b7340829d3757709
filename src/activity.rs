//! Recent per-device activity.
//!
//! Every lifecycle action is logged on the `activity` tracing target and
//! kept in a short in-memory history surfaced by status queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Entries kept per device.
pub const MAX_ACTIVITIES: usize = 7;

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Acting identity.
    pub actor: String,
    /// What was done.
    pub action: String,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} by {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.action,
            self.actor
        )
    }
}

/// Bounded activity history keyed by device.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: HashMap<String, VecDeque<Activity>>,
}

impl ActivityLog {
    /// Record `action` by `actor` on `device`.
    pub fn record(&mut self, device: &str, actor: &str, action: &str, at: DateTime<Utc>) {
        tracing::info!(target: "activity", device = %device, actor = %actor, action = %action, "device activity");
        let history = self.entries.entry(device.to_string()).or_default();
        if history.len() == MAX_ACTIVITIES {
            history.pop_front();
        }
        history.push_back(Activity {
            at,
            actor: actor.to_string(),
            action: action.to_string(),
        });
    }

    /// History for `device`, oldest first.
    pub fn recent(&self, device: &str) -> Vec<Activity> {
        self.entries
            .get(device)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent entry for `device`.
    pub fn last(&self, device: &str) -> Option<&Activity> {
        self.entries.get(device).and_then(VecDeque::back)
    }
}
