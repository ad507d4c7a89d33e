use chrono::Utc;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::TaskEvent;
use super::states::TaskLifecycleState;
use crate::models::{TaskEnvelope, TaskResultStatus};

/// Transition table and side effects for a task envelope's lifecycle
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Determine the target state for an event in the current state
    pub fn determine_target_state(
        current_state: TaskLifecycleState,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskLifecycleState> {
        use TaskLifecycleState::*;

        let target = match (current_state, event) {
            (Runnable, TaskEvent::Claim(_)) => Running,
            (Running, TaskEvent::Release) => Runnable,

            (Running, TaskEvent::Wait(_)) => Waiting,
            (Waiting, TaskEvent::Wake) => Runnable,

            (Runnable | Waiting | Running, TaskEvent::Suspend) => Suspended,
            (Suspended, TaskEvent::Resume) => Runnable,

            (Running, TaskEvent::Finish) => Closed,
            (Running, TaskEvent::Fail(_)) => Closed,

            (Runnable | Waiting | Running | Suspended, TaskEvent::Cancel) => Closed,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    entity: "task",
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` to `task`, returning the new lifecycle state.
    ///
    /// Ownership and result fields are maintained here so every caller leaves the
    /// envelope in the same shape for a given transition.
    pub fn transition(
        task: &mut TaskEnvelope,
        event: TaskEvent,
    ) -> StateMachineResult<TaskLifecycleState> {
        let target = Self::determine_target_state(task.lifecycle_state, &event)?;

        match event {
            TaskEvent::Claim(node_id) => {
                task.execution_node_id = Some(node_id);
                task.control_request = None;
                task.result_status = TaskResultStatus::InProgress;
                task.run_count += 1;
            }
            TaskEvent::Release => {
                task.execution_node_id = None;
            }
            TaskEvent::Wait(until) => {
                task.execution_node_id = None;
                task.next_run_at = Some(until);
            }
            TaskEvent::Wake => {
                task.next_run_at = None;
            }
            TaskEvent::Suspend => {
                task.execution_node_id = None;
                task.control_request = None;
            }
            TaskEvent::Resume => {
                task.auto_resume_at = None;
                task.control_request = None;
            }
            TaskEvent::Finish => {
                task.execution_node_id = None;
                task.control_request = None;
                let failed_items = task.root_activity.rolled_up_statistics(0).failed;
                task.result_status = if failed_items > 0 {
                    TaskResultStatus::PartialError { failed_items }
                } else {
                    TaskResultStatus::Success
                };
            }
            TaskEvent::Fail(reason) => {
                task.execution_node_id = None;
                task.control_request = None;
                task.result_status = TaskResultStatus::FatalError { reason };
            }
            TaskEvent::Cancel => {
                task.execution_node_id = None;
                task.control_request = None;
                task.auto_resume_at = None;
                task.next_run_at = None;
                task.result_status = TaskResultStatus::Cancelled;
            }
        }

        task.lifecycle_state = target;
        task.updated_at = Utc::now();
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityNode, ActivityPath, ObjectFilter, Schedule, WorkDefinition};
    use TaskLifecycleState::*;

    fn task() -> TaskEnvelope {
        TaskEnvelope::new(
            "test",
            ActivityNode::leaf("root", WorkDefinition::query("user", ObjectFilter::All, "noop")),
            Schedule::once(),
        )
    }

    #[test]
    fn test_claim_and_finish() {
        let mut task = task();
        TaskStateMachine::transition(&mut task, TaskEvent::Claim("node-a".to_string())).unwrap();
        assert_eq!(task.lifecycle_state, Running);
        assert_eq!(task.execution_node_id.as_deref(), Some("node-a"));
        assert_eq!(task.result_status, TaskResultStatus::InProgress);
        assert_eq!(task.run_count, 1);

        TaskStateMachine::transition(&mut task, TaskEvent::Finish).unwrap();
        assert_eq!(task.lifecycle_state, Closed);
        assert_eq!(task.execution_node_id, None);
        assert_eq!(task.result_status, TaskResultStatus::Success);
    }

    #[test]
    fn test_finish_with_item_failures_is_partial() {
        let mut task = task();
        task.activity_mut(&ActivityPath::root("root"))
            .unwrap()
            .work_state
            .statistics
            .failed = 3;
        TaskStateMachine::transition(&mut task, TaskEvent::Claim("node-a".to_string())).unwrap();
        TaskStateMachine::transition(&mut task, TaskEvent::Finish).unwrap();
        assert_eq!(
            task.result_status,
            TaskResultStatus::PartialError { failed_items: 3 }
        );
    }

    #[test]
    fn test_fail_preserves_reason() {
        let mut task = task();
        TaskStateMachine::transition(&mut task, TaskEvent::Claim("node-a".to_string())).unwrap();
        TaskStateMachine::transition(&mut task, TaskEvent::Fail("repository gone".to_string()))
            .unwrap();
        assert_eq!(
            task.result_status,
            TaskResultStatus::FatalError {
                reason: "repository gone".to_string()
            }
        );
    }

    #[test]
    fn test_transition_table() {
        let valid = [
            (Runnable, TaskEvent::Claim("n".to_string()), Running),
            (Running, TaskEvent::Release, Runnable),
            (Running, TaskEvent::Wait(Utc::now()), Waiting),
            (Waiting, TaskEvent::Wake, Runnable),
            (Waiting, TaskEvent::Suspend, Suspended),
            (Suspended, TaskEvent::Resume, Runnable),
            (Suspended, TaskEvent::Cancel, Closed),
            (Running, TaskEvent::Cancel, Closed),
        ];
        for (from, event, to) in valid {
            assert_eq!(TaskStateMachine::determine_target_state(from, &event), Ok(to));
        }

        let invalid = [
            (Closed, TaskEvent::Resume),
            (Closed, TaskEvent::Cancel),
            (Suspended, TaskEvent::Claim("n".to_string())),
            (Running, TaskEvent::Claim("n".to_string())),
            (Runnable, TaskEvent::Finish),
            (Suspended, TaskEvent::Suspend),
            (Runnable, TaskEvent::Resume),
        ];
        for (from, event) in invalid {
            assert!(TaskStateMachine::determine_target_state(from, &event).is_err());
        }
    }

    #[test]
    fn test_cancel_clears_schedule_fields() {
        let mut task = task();
        task.auto_resume_at = Some(Utc::now());
        TaskStateMachine::transition(&mut task, TaskEvent::Suspend).unwrap();
        TaskStateMachine::transition(&mut task, TaskEvent::Cancel).unwrap();
        assert_eq!(task.lifecycle_state, Closed);
        assert_eq!(task.result_status, TaskResultStatus::Cancelled);
        assert_eq!(task.auto_resume_at, None);
    }
}
