//! Worker lifecycle state machine.
//!
//! ```text
//! Parsed ──install──► Installing ──ok──► Installed ──activate──► Activating ──done──► Activated
//!                         │                  │                                          │
//!                         └──failed──► Redundant ◄──────────────superseded──────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Script evaluated, nothing installed yet.
    #[default]
    Parsed,
    /// Precache in progress.
    Installing,
    /// Installed and waiting to activate.
    Installed,
    /// Old generations being removed.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

/// Lifecycle inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Install,
    InstallSucceeded,
    InstallFailed,
    Activate,
    ActivationComplete,
    Superseded,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }

    /// Apply `event`, rejecting anything outside the transition table.
    pub fn transition(self, event: LifecycleEvent) -> Result<WorkerState, ServiceWorkerError> {
        use LifecycleEvent::*;
        use WorkerState::*;

        match (self, event) {
            (Parsed, Install) => Ok(Installing),
            (Installing, InstallSucceeded) => Ok(Installed),
            (Installing, InstallFailed) => Ok(Redundant),
            (Installed, Activate) => Ok(Activating),
            (Activating, ActivationComplete) => Ok(Activated),
            (Installed | Activating | Activated, Superseded) => Ok(Redundant),
            (state, event) => Err(ServiceWorkerError::InvalidState { state, event }),
        }
    }

    /// Only an activated worker intercepts requests.
    pub fn controls_fetches(&self) -> bool {
        *self == WorkerState::Activated
    }

    pub fn is_terminal(&self) -> bool {
        *self == WorkerState::Redundant
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Install => "install",
            LifecycleEvent::InstallSucceeded => "finish install",
            LifecycleEvent::InstallFailed => "fail install",
            LifecycleEvent::Activate => "activate",
            LifecycleEvent::ActivationComplete => "finish activation",
            LifecycleEvent::Superseded => "be superseded",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = WorkerState::default()
            .transition(LifecycleEvent::Install)
            .and_then(|s| s.transition(LifecycleEvent::InstallSucceeded))
            .and_then(|s| s.transition(LifecycleEvent::Activate))
            .and_then(|s| s.transition(LifecycleEvent::ActivationComplete))
            .unwrap();

        assert_eq!(state, WorkerState::Activated);
        assert!(state.controls_fetches());
    }

    #[test]
    fn test_failed_install_is_terminal() {
        let state = WorkerState::Installing
            .transition(LifecycleEvent::InstallFailed)
            .unwrap();
        assert!(state.is_terminal());
        assert!(state.transition(LifecycleEvent::Install).is_err());
        assert!(state.transition(LifecycleEvent::Activate).is_err());
    }

    #[test]
    fn test_cannot_activate_before_install() {
        let err = WorkerState::Parsed
            .transition(LifecycleEvent::Activate)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceWorkerError::InvalidState {
                state: WorkerState::Parsed,
                event: LifecycleEvent::Activate
            }
        ));
    }

    #[test]
    fn test_only_activated_controls_fetches() {
        for state in [
            WorkerState::Parsed,
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Redundant,
        ] {
            assert!(!state.controls_fetches(), "{state} must not control fetches");
        }
    }

    #[test]
    fn test_install_is_not_reentrant() {
        assert!(WorkerState::Installing
            .transition(LifecycleEvent::Install)
            .is_err());
        assert!(WorkerState::Activated
            .transition(LifecycleEvent::Install)
            .is_err());
    }

    #[test]
    fn test_superseded_from_live_states() {
        for state in [
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ] {
            assert_eq!(
                state.transition(LifecycleEvent::Superseded).unwrap(),
                WorkerState::Redundant
            );
        }
        assert!(WorkerState::Parsed
            .transition(LifecycleEvent::Superseded)
            .is_err());
    }

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }
}
