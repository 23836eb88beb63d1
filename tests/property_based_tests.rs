//! Property tests over the status transition function.

use proptest::prelude::*;

use docflow_core::models::TaskType;
use docflow_core::state_machine::{target_status, TaskEvent, TaskStatus};

fn any_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Queued),
        Just(TaskStatus::Running),
        Just(TaskStatus::StepFailed),
        Just(TaskStatus::Succeeded),
        Just(TaskStatus::Failed),
    ]
}

fn any_event() -> impl Strategy<Value = TaskEvent> {
    prop_oneof![
        Just(TaskEvent::Enqueue),
        Just(TaskEvent::Claim),
        Just(TaskEvent::Complete),
        ".{0,20}".prop_map(TaskEvent::FailStep),
        ".{0,20}".prop_map(TaskEvent::Fail),
    ]
}

fn any_task_type() -> impl Strategy<Value = TaskType> {
    prop_oneof![Just(TaskType::FullPipeline), Just(TaskType::RegenerateStep)]
}

proptest! {
    /// Terminal states accept no event at all
    #[test]
    fn terminal_states_are_absorbing(
        status in prop_oneof![Just(TaskStatus::Succeeded), Just(TaskStatus::Failed)],
        event in any_event(),
        task_type in any_task_type(),
    ) {
        prop_assert!(target_status(status, &event, task_type).is_err());
    }

    /// No event ever moves a task out of a terminal state, and every
    /// accepted transition lands on a defined status
    #[test]
    fn transitions_never_resurrect(
        status in any_status(),
        event in any_event(),
        task_type in any_task_type(),
    ) {
        if let Ok(next) = target_status(status, &event, task_type) {
            prop_assert!(!status.is_terminal());
            // Self-transitions to terminal states only happen via outcomes
            if next.is_terminal() {
                prop_assert!(matches!(
                    event,
                    TaskEvent::Complete | TaskEvent::Fail(_) | TaskEvent::FailStep(_)
                ));
            }
        }
    }

    /// Outcome events are accepted only while running
    #[test]
    fn outcomes_require_a_running_task(
        status in any_status(),
        error in ".{0,20}",
        task_type in any_task_type(),
    ) {
        for event in [
            TaskEvent::Complete,
            TaskEvent::Fail(error.clone()),
            TaskEvent::FailStep(error.clone()),
        ] {
            let result = target_status(status, &event, task_type);
            if status == TaskStatus::Running {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }
    }

    /// A failed step is resumable only for full-pipeline tasks
    #[test]
    fn step_failure_resumability_depends_on_task_type(error in ".{0,20}") {
        let resumed = target_status(
            TaskStatus::Running,
            &TaskEvent::FailStep(error.clone()),
            TaskType::FullPipeline,
        ).unwrap();
        prop_assert_eq!(resumed, TaskStatus::StepFailed);

        let terminal = target_status(
            TaskStatus::Running,
            &TaskEvent::FailStep(error),
            TaskType::RegenerateStep,
        ).unwrap();
        prop_assert_eq!(terminal, TaskStatus::Failed);

        // And the resumable state is claimable only for full pipelines
        prop_assert!(target_status(TaskStatus::StepFailed, &TaskEvent::Claim, TaskType::FullPipeline).is_ok());
        prop_assert!(target_status(TaskStatus::StepFailed, &TaskEvent::Claim, TaskType::RegenerateStep).is_err());
    }
}
