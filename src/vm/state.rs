//! Canonical VM state vocabulary.

use serde::{Deserialize, Serialize};

/// Backend-independent VM status.
///
/// Every adapter maps its native vocabulary onto this set. Backends that
/// can only tell running from not-running report `Active` or `Paused`;
/// native states without a mapping become `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalState {
    /// No instance exists.
    NonExistent,
    /// Running.
    Active,
    /// Quiesced but still allocated.
    Paused,
    /// Provisioning in progress.
    Build,
    /// Backend reports a failure state.
    Error,
    /// Native state with no canonical mapping.
    Unrecognized,
}

impl CanonicalState {
    /// Check if the VM is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, CanonicalState::Active)
    }

    /// Check if start may act from this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            CanonicalState::Active | CanonicalState::Paused | CanonicalState::NonExistent
        )
    }

    /// Check if restore may act from this state.
    pub fn can_restore(&self) -> bool {
        matches!(self, CanonicalState::Paused | CanonicalState::NonExistent)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalState::NonExistent => "NON_EXISTENT",
            CanonicalState::Active => "ACTIVE",
            CanonicalState::Paused => "PAUSED",
            CanonicalState::Build => "BUILD",
            CanonicalState::Error => "ERROR",
            CanonicalState::Unrecognized => "UNRECOGNIZED",
        }
    }
}

impl std::fmt::Display for CanonicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        // (state, is_running, can_start, can_restore)
        let cases = [
            (CanonicalState::NonExistent, false, true, true),
            (CanonicalState::Active, true, true, false),
            (CanonicalState::Paused, false, true, true),
            (CanonicalState::Build, false, false, false),
            (CanonicalState::Error, false, false, false),
            (CanonicalState::Unrecognized, false, false, false),
        ];

        for (state, running, start, restore) in cases {
            assert_eq!(state.is_running(), running, "{:?}.is_running()", state);
            assert_eq!(state.can_start(), start, "{:?}.can_start()", state);
            assert_eq!(state.can_restore(), restore, "{:?}.can_restore()", state);
        }
    }

    #[test]
    fn test_serializes_like_display() {
        let json = serde_json::to_string(&CanonicalState::NonExistent).unwrap();
        assert_eq!(json, format!("\"{}\"", CanonicalState::NonExistent));
    }
}
