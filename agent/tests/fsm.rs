//! Rollout FSM tests

use rollout_agent::deploy::fsm::{RolloutEvent, RolloutFsm, RolloutState};

#[test]
fn test_fsm_initial_state() {
    let fsm = RolloutFsm::new();
    assert_eq!(fsm.state(), RolloutState::Received);
    assert!(fsm.error().is_none());
    assert!(fsm.failed_at().is_none());
}

#[test]
fn test_fsm_stage_order() {
    let mut state = RolloutState::Received;
    let mut visited = vec![state];
    while let Some(next) = state.next() {
        visited.push(next);
        state = next;
    }

    assert_eq!(visited.len(), 15);
    assert_eq!(visited[2], RolloutState::Locked);
    assert_eq!(visited[10], RolloutState::HealthVerified);
    assert_eq!(state, RolloutState::Succeeded);
    assert!(state.is_terminal());
}

#[test]
fn test_fsm_failure_during_build_rolls_back() {
    let mut fsm = RolloutFsm::new();

    // Received -> ... -> OldContainerSnapshotted
    for _ in 0..7 {
        fsm.process(RolloutEvent::Advance).unwrap();
    }
    assert_eq!(fsm.state(), RolloutState::OldContainerSnapshotted);

    fsm.process(RolloutEvent::Fail("build failed".to_string())).unwrap();
    assert_eq!(fsm.state(), RolloutState::RollingBack);
    assert_eq!(fsm.error(), Some("build failed"));

    // No second failure while rolling back
    assert!(fsm.process(RolloutEvent::Fail("again".to_string())).is_err());

    fsm.process(RolloutEvent::RollbackFinished).unwrap();
    assert_eq!(fsm.state(), RolloutState::Failed);
    assert!(fsm.process(RolloutEvent::Advance).is_err());
}

#[test]
fn test_fsm_rollback_only_after_rollback_started() {
    let mut fsm = RolloutFsm::new();
    assert!(fsm.process(RolloutEvent::RollbackFinished).is_err());
    assert_eq!(fsm.state(), RolloutState::Received);
}
