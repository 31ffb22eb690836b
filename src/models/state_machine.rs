// Task status state machine with validation

use super::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {0} is already processing; only one task may run at a time")]
    AlreadyProcessing(String),

    #[error("Task not found: {0}")]
    NotFound(String),
}

/// Validates if a task can move from one status to another.
///
/// Transitions are monotone: nothing ever goes back to pending, and terminal
/// states are final.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Processing)
            | (TaskStatus::Pending, TaskStatus::Error)
            | (TaskStatus::Processing, TaskStatus::Completed)
            | (TaskStatus::Processing, TaskStatus::Error)
    )
}

/// Validates and performs a state transition
pub fn transition_state(
    current: TaskStatus,
    target: TaskStatus,
) -> Result<TaskStatus, StateTransitionError> {
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Completed | TaskStatus::Error)
}
