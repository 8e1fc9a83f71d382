//! Finite State Machine for a blue-green rollout

use serde::{Deserialize, Serialize};

/// Rollout state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    /// Request accepted, not yet validated
    Received,
    Validated,
    Locked,
    DirectoriesReady,
    EnvFetched,
    SourceFetched,
    TypeResolved,
    OldContainerSnapshotted,
    NewContainerBuilt,
    NewContainerStarted,
    HealthVerified,
    TrafficRegistered,
    TrafficSwitchVerified,
    OldContainerRetired,
    Succeeded,

    /// Undoing a failed rollout
    RollingBack,
    Failed,
}

/// Happy-path order
const ORDER: [RolloutState; 15] = [
    RolloutState::Received,
    RolloutState::Validated,
    RolloutState::Locked,
    RolloutState::DirectoriesReady,
    RolloutState::EnvFetched,
    RolloutState::SourceFetched,
    RolloutState::TypeResolved,
    RolloutState::OldContainerSnapshotted,
    RolloutState::NewContainerBuilt,
    RolloutState::NewContainerStarted,
    RolloutState::HealthVerified,
    RolloutState::TrafficRegistered,
    RolloutState::TrafficSwitchVerified,
    RolloutState::OldContainerRetired,
    RolloutState::Succeeded,
];

impl RolloutState {
    /// Successor on the happy path
    pub fn next(&self) -> Option<RolloutState> {
        let index = ORDER.iter().position(|s| s == self)?;
        ORDER.get(index + 1).copied()
    }

    /// The deployment lock is held in this state
    pub fn holds_lock(&self) -> bool {
        let Some(index) = ORDER.iter().position(|s| s == self) else {
            return *self == RolloutState::RollingBack;
        };
        let locked = ORDER
            .iter()
            .position(|s| *s == RolloutState::Locked)
            .unwrap_or(usize::MAX);
        index >= locked && *self != RolloutState::Succeeded
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutState::Succeeded | RolloutState::Failed)
    }
}

/// Rollout event
#[derive(Debug, Clone)]
pub enum RolloutEvent {
    /// Current stage finished
    Advance,

    /// Current stage failed
    Fail(String),

    /// Rollback attempt finished, whatever its outcome
    RollbackFinished,
}

/// Rollout FSM
#[derive(Debug, Clone)]
pub struct RolloutFsm {
    state: RolloutState,
    error: Option<String>,
    /// Last state reached before failing
    failed_at: Option<RolloutState>,
}

impl RolloutFsm {
    /// Create a new FSM in received state
    pub fn new() -> Self {
        Self {
            state: RolloutState::Received,
            error: None,
            failed_at: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> RolloutState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failed_at(&self) -> Option<RolloutState> {
        self.failed_at
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RolloutEvent) -> Result<RolloutState, String> {
        let new_state = match (self.state, &event) {
            (RolloutState::RollingBack, RolloutEvent::RollbackFinished) => RolloutState::Failed,

            (state, RolloutEvent::Advance) if !state.is_terminal() => match state.next() {
                Some(next) => next,
                None => return Err(format!("Invalid transition: {:?} -> {:?}", state, event)),
            },

            (state, RolloutEvent::Fail(err))
                if !state.is_terminal() && state != RolloutState::RollingBack =>
            {
                self.error = Some(err.clone());
                self.failed_at = Some(state);
                if state.holds_lock() {
                    RolloutState::RollingBack
                } else {
                    RolloutState::Failed
                }
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }

    /// Advance to the given stage, which must be the direct successor
    pub fn advance_to(&mut self, expected: RolloutState) -> Result<(), String> {
        if self.state.next() != Some(expected) {
            return Err(format!(
                "Invalid transition: {:?} -> {:?}",
                self.state, expected
            ));
        }
        self.process(RolloutEvent::Advance).map(|_| ())
    }
}

impl Default for RolloutFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsm_happy_path() {
        let mut fsm = RolloutFsm::new();
        for expected in ORDER.iter().skip(1) {
            fsm.advance_to(*expected).unwrap();
        }
        assert_eq!(fsm.state(), RolloutState::Succeeded);
        assert!(fsm.process(RolloutEvent::Advance).is_err());
    }

    #[test]
    fn test_fsm_rejects_skipped_stage() {
        let mut fsm = RolloutFsm::new();
        fsm.advance_to(RolloutState::Validated).unwrap();
        assert!(fsm.advance_to(RolloutState::DirectoriesReady).is_err());
        assert_eq!(fsm.state(), RolloutState::Validated);
    }

    #[test]
    fn test_fsm_failure_before_lock_skips_rollback() {
        let mut fsm = RolloutFsm::new();
        fsm.advance_to(RolloutState::Validated).unwrap();
        let state = fsm.process(RolloutEvent::Fail("busy".to_string())).unwrap();
        assert_eq!(state, RolloutState::Failed);
        assert_eq!(fsm.error(), Some("busy"));
    }

    #[test]
    fn test_fsm_failure_after_lock_rolls_back() {
        let mut fsm = RolloutFsm::new();
        for expected in &ORDER[1..=10] {
            fsm.advance_to(*expected).unwrap();
        }
        assert_eq!(fsm.state(), RolloutState::HealthVerified);

        fsm.process(RolloutEvent::Fail("no route".to_string())).unwrap();
        assert_eq!(fsm.state(), RolloutState::RollingBack);
        assert_eq!(fsm.failed_at(), Some(RolloutState::HealthVerified));
        assert!(fsm.process(RolloutEvent::Advance).is_err());

        fsm.process(RolloutEvent::RollbackFinished).unwrap();
        assert_eq!(fsm.state(), RolloutState::Failed);
    }

    #[test]
    fn test_fsm_rejects_events_after_terminal() {
        let mut fsm = RolloutFsm::new();
        fsm.process(RolloutEvent::Fail("bad request".to_string())).unwrap();
        assert_eq!(fsm.state(), RolloutState::Failed);

        assert!(fsm.process(RolloutEvent::Fail("again".to_string())).is_err());
        assert!(fsm.process(RolloutEvent::RollbackFinished).is_err());
        assert_eq!(fsm.state(), RolloutState::Failed);
        assert_eq!(fsm.error(), Some("bad request"));
    }

    #[test]
    fn test_holds_lock() {
        assert!(!RolloutState::Validated.holds_lock());
        assert!(RolloutState::Locked.holds_lock());
        assert!(RolloutState::OldContainerRetired.holds_lock());
        assert!(RolloutState::RollingBack.holds_lock());
        assert!(!RolloutState::Succeeded.holds_lock());
    }
}
