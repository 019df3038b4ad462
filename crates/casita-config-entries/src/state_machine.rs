//! Config entry state machine
//!
//! Enforces valid lifecycle transitions:
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress (re-setup)
//!
//! Loaded/SetupError → UnloadInProgress → NotLoaded
//!                                      ↘ FailedUnload (terminal)
//! ```

use crate::entry::ConfigEntryState;
use thiserror::Error;

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Attempt a transition to a new state
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded)
                | (SetupInProgress, SetupError)
                | (SetupError, SetupInProgress)
                | (SetupError, UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded)
                | (UnloadInProgress, FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    /// Check whether a transition is valid without performing it
    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (from, to) {
            (FailedUnload, _) => "FailedUnload is terminal - entry cannot recover",
            (NotLoaded, Loaded) => "Cannot jump to Loaded - must go through SetupInProgress",
            (Loaded, NotLoaded) => "Cannot jump to NotLoaded - must go through UnloadInProgress",
            (Loaded, SetupInProgress) => "Already loaded - unload first before re-setup",
            (UnloadInProgress, Loaded) => "Unload in progress - cannot go back to Loaded",
            _ => "Invalid state transition",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConfigEntryState::*;

    #[test]
    fn test_setup_success_path() {
        let state = NotLoaded;
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(Loaded).unwrap();
        let state = state.try_transition(UnloadInProgress).unwrap();
        let state = state.try_transition(NotLoaded).unwrap();
        assert_eq!(state, NotLoaded);
    }

    #[test]
    fn test_setup_error_recovery_path() {
        let state = NotLoaded;
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(SetupError).unwrap();
        let state = state.try_transition(SetupInProgress).unwrap();
        let state = state.try_transition(Loaded).unwrap();
        assert_eq!(state, Loaded);
    }

    #[test]
    fn test_unload_from_setup_error() {
        assert!(SetupError.can_transition_to(UnloadInProgress));
        assert!(UnloadInProgress.can_transition_to(NotLoaded));
    }

    #[test]
    fn test_invalid_jumps_rejected() {
        assert!(!NotLoaded.can_transition_to(Loaded));
        assert!(!Loaded.can_transition_to(NotLoaded));
        assert!(!Loaded.can_transition_to(SetupInProgress));
        assert!(!SetupInProgress.can_transition_to(NotLoaded));
        assert!(!UnloadInProgress.can_transition_to(Loaded));
    }

    #[test]
    fn test_failed_unload_is_terminal() {
        assert!(!FailedUnload.can_transition_to(NotLoaded));
        assert!(!FailedUnload.can_transition_to(SetupInProgress));
        assert!(!FailedUnload.can_transition_to(Loaded));
        assert!(!FailedUnload.can_transition_to(UnloadInProgress));
    }

    #[test]
    fn test_error_carries_transition_details() {
        let err = NotLoaded.try_transition(Loaded).unwrap_err();
        assert_eq!(err.from, NotLoaded);
        assert_eq!(err.to, Loaded);
        let msg = format!("{}", err);
        assert!(msg.contains("NotLoaded"));
        assert!(msg.contains("SetupInProgress"));
    }
}
