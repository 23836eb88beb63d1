// State machine module for pipeline task lifecycle management
//
// The transition function is pure; persistence of a transition is the task
// store's job, performed inside its atomic conditional update so that the
// state machine stays correct across multiple cooperating processes.

pub mod events;
pub mod states;

pub use events::TaskEvent;
pub use states::TaskStatus;

use crate::error::{DocflowError, Result};
use crate::models::TaskType;

/// Determine the target status for an event applied to a task.
///
/// Terminal states absorb everything; `step_failed` can only be re-admitted
/// for full-pipeline tasks.
pub fn target_status(
    current: TaskStatus,
    event: &TaskEvent,
    task_type: TaskType,
) -> Result<TaskStatus> {
    let target = match (current, event) {
        (TaskStatus::Pending, TaskEvent::Enqueue) => TaskStatus::Queued,
        (TaskStatus::Pending, TaskEvent::Claim) => TaskStatus::Running,
        (TaskStatus::Queued, TaskEvent::Claim) => TaskStatus::Running,

        // Resume path: only full-pipeline tasks leave step_failed.
        (TaskStatus::StepFailed, TaskEvent::Enqueue | TaskEvent::Claim)
            if task_type == TaskType::FullPipeline =>
        {
            match event {
                TaskEvent::Claim => TaskStatus::Running,
                _ => TaskStatus::Queued,
            }
        }

        // Crashed-worker recovery re-admits a running task.
        (TaskStatus::Running, TaskEvent::Enqueue) => TaskStatus::Queued,

        (TaskStatus::Running, TaskEvent::Complete) => TaskStatus::Succeeded,
        (TaskStatus::Running, TaskEvent::FailStep(_)) if task_type == TaskType::FullPipeline => {
            TaskStatus::StepFailed
        }
        (TaskStatus::Running, TaskEvent::FailStep(_)) => TaskStatus::Failed,
        (TaskStatus::Running, TaskEvent::Fail(_)) => TaskStatus::Failed,

        (from, event) => {
            return Err(DocflowError::StateTransitionError(format!(
                "cannot apply {event:?} to a {from} {task_type} task"
            )))
        }
    };

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_transitions() {
        assert_eq!(
            target_status(TaskStatus::Pending, &TaskEvent::Claim, TaskType::FullPipeline).unwrap(),
            TaskStatus::Running
        );
        assert_eq!(
            target_status(TaskStatus::Queued, &TaskEvent::Claim, TaskType::RegenerateStep).unwrap(),
            TaskStatus::Running
        );
    }

    #[test]
    fn test_resume_is_full_pipeline_only() {
        assert_eq!(
            target_status(
                TaskStatus::StepFailed,
                &TaskEvent::Claim,
                TaskType::FullPipeline
            )
            .unwrap(),
            TaskStatus::Running
        );
        assert!(target_status(
            TaskStatus::StepFailed,
            &TaskEvent::Claim,
            TaskType::RegenerateStep
        )
        .is_err());
    }

    #[test]
    fn test_step_failure_maps_by_task_type() {
        assert_eq!(
            target_status(
                TaskStatus::Running,
                &TaskEvent::FailStep("boom".to_string()),
                TaskType::FullPipeline
            )
            .unwrap(),
            TaskStatus::StepFailed
        );
        assert_eq!(
            target_status(
                TaskStatus::Running,
                &TaskEvent::FailStep("boom".to_string()),
                TaskType::RegenerateStep
            )
            .unwrap(),
            TaskStatus::Failed
        );
    }

    #[test]
    fn test_terminal_states_absorb() {
        for status in [TaskStatus::Succeeded, TaskStatus::Failed] {
            for event in [
                TaskEvent::Enqueue,
                TaskEvent::Claim,
                TaskEvent::Complete,
                TaskEvent::Fail("late".to_string()),
            ] {
                assert!(
                    target_status(status, &event, TaskType::FullPipeline).is_err(),
                    "{status} should reject {event:?}"
                );
            }
        }
    }
}
