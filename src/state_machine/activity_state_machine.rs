use chrono::Utc;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::ActivityEvent;
use super::states::ActivityState;
use crate::models::ActivityWorkState;

/// Transition table and side effects for an activity node's realization state
pub struct ActivityStateMachine;

impl ActivityStateMachine {
    /// Determine the target state for an event in the current state
    pub fn determine_target_state(
        current_state: ActivityState,
        event: &ActivityEvent,
    ) -> StateMachineResult<ActivityState> {
        let target = match (current_state, event) {
            (ActivityState::NotStarted, ActivityEvent::Start) => ActivityState::InProgress,

            (ActivityState::InProgress, ActivityEvent::Complete) => ActivityState::Complete,

            (ActivityState::InProgress, ActivityEvent::Suspend) => ActivityState::Suspended,
            (ActivityState::Suspended, ActivityEvent::Resume) => ActivityState::InProgress,

            (ActivityState::InProgress, ActivityEvent::Fail(_)) => ActivityState::Failed,

            // Fresh run of a recurring task
            (
                ActivityState::NotStarted
                | ActivityState::Complete
                | ActivityState::Failed
                | ActivityState::Suspended,
                ActivityEvent::Reset,
            ) => ActivityState::NotStarted,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    entity: "activity",
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    fn check_guards(
        work_state: &ActivityWorkState,
        target_state: ActivityState,
    ) -> StateMachineResult<()> {
        if target_state == ActivityState::Complete && work_state.bucketing.has_outstanding() {
            return Err(StateMachineError::GuardFailed {
                reason: "activity still has ready or delegated buckets".to_string(),
            });
        }
        Ok(())
    }

    /// Apply `event` to `work_state`, returning the new state
    pub fn transition(
        work_state: &mut ActivityWorkState,
        event: ActivityEvent,
    ) -> StateMachineResult<ActivityState> {
        let target = Self::determine_target_state(work_state.realization_state, &event)?;
        Self::check_guards(work_state, target)?;

        let now = Utc::now();
        match event {
            ActivityEvent::Start => {
                work_state.started_at = Some(now);
                work_state.statistics.wall_clock_start.get_or_insert(now);
            }
            ActivityEvent::Complete => {
                work_state.finished_at = Some(now);
                work_state.statistics.wall_clock_end = Some(now);
            }
            ActivityEvent::Fail(reason) => {
                work_state.finished_at = Some(now);
                work_state.statistics.wall_clock_end = Some(now);
                work_state.statistics.last_error = Some(reason.clone());
                work_state.failure_reason = Some(reason);
            }
            ActivityEvent::Reset => {
                *work_state = ActivityWorkState::default();
            }
            ActivityEvent::Suspend | ActivityEvent::Resume => {}
        }

        work_state.realization_state = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BucketContent;

    #[test]
    fn test_happy_path() {
        let mut ws = ActivityWorkState::default();
        assert_eq!(
            ActivityStateMachine::transition(&mut ws, ActivityEvent::Start),
            Ok(ActivityState::InProgress)
        );
        assert!(ws.started_at.is_some());
        assert_eq!(
            ActivityStateMachine::transition(&mut ws, ActivityEvent::Complete),
            Ok(ActivityState::Complete)
        );
        assert!(ws.finished_at.is_some());
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let mut ws = ActivityWorkState::default();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Start).unwrap();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Suspend).unwrap();
        assert_eq!(ws.realization_state, ActivityState::Suspended);
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Resume).unwrap();
        assert_eq!(ws.realization_state, ActivityState::InProgress);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut ws = ActivityWorkState::default();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Start).unwrap();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Fail("boom".to_string())).unwrap();
        assert_eq!(ws.realization_state, ActivityState::Failed);
        assert_eq!(ws.failure_reason.as_deref(), Some("boom"));
        assert_eq!(ws.statistics.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let cases = [
            (ActivityState::NotStarted, ActivityEvent::Complete),
            (ActivityState::NotStarted, ActivityEvent::Suspend),
            (ActivityState::Complete, ActivityEvent::Start),
            (ActivityState::Complete, ActivityEvent::Fail("x".to_string())),
            (ActivityState::Failed, ActivityEvent::Resume),
            (ActivityState::Suspended, ActivityEvent::Complete),
            (ActivityState::InProgress, ActivityEvent::Start),
            (ActivityState::InProgress, ActivityEvent::Reset),
        ];
        for (state, event) in cases {
            let result = ActivityStateMachine::determine_target_state(state, &event);
            assert!(
                matches!(result, Err(StateMachineError::InvalidTransition { .. })),
                "{state} on {} should be rejected",
                event.event_type()
            );
        }
    }

    #[test]
    fn test_complete_guard_requires_no_outstanding_buckets() {
        let mut ws = ActivityWorkState::default();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Start).unwrap();
        ws.bucketing.append(BucketContent::All);
        assert!(matches!(
            ActivityStateMachine::transition(&mut ws, ActivityEvent::Complete),
            Err(StateMachineError::GuardFailed { .. })
        ));
        assert_eq!(ws.realization_state, ActivityState::InProgress);
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut ws = ActivityWorkState::default();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Start).unwrap();
        ws.statistics.succeeded = 5;
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Complete).unwrap();
        ActivityStateMachine::transition(&mut ws, ActivityEvent::Reset).unwrap();
        assert_eq!(ws, ActivityWorkState::default());
    }
}
