//! Session management core module.
//!
//! A workspace owns one shared catalog database and at most one open test
//! session at a time. This module holds the session lifecycle types and the
//! submodules implementing the session store and the workspace boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error_handling::types::SessionError;

/// Submodule for the state of the currently open session.
pub mod active_session;
/// Submodule for notifications emitted by the session store.
pub mod events;
/// Submodule for the catalog and per-session table descriptions.
pub mod schemas;
/// Submodule for session data structures and utilities.
pub mod session;
/// Submodule for the per-workspace session store.
pub mod session_manager;
/// Submodule for the multi-workspace boundary.
pub mod workspace;

/// Lifecycle of a test session.
///
/// `Created -> Active <-> Paused -> Completed | Failed -> Archived`.
/// Any status may be re-applied to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    Completed,
    Failed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Completed)
                | (Created, Failed)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Completed, Archived)
                | (Failed, Archived)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionStatus::Created),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(SessionError::InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Archived));
        assert!(Completed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Created));
        assert!(!Created.can_transition_to(Archived));
    }

    #[test]
    fn status_parses_from_catalog_text() {
        for status in [
            SessionStatus::Created,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!(matches!(
            "running".parse::<SessionStatus>(),
            Err(SessionError::InvalidStatus(_))
        ));
    }
}
