// Error taxonomy for session supervision and task execution

use crate::models::TaskErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("{tool} not found. {hint}")]
    Dependency { tool: String, hint: String },

    #[error("Session exited unexpectedly (exit code {exit_code:?})")]
    SessionCrash { exit_code: Option<i32> },

    #[error("Session did not become ready within {waited_ms}ms")]
    SessionNotReady { waited_ms: u64 },

    #[error("No active session")]
    NoSession,

    #[error("Failed to write to session: {0}")]
    Send(String),

    #[error("Task did not complete within {timeout_ms}ms")]
    DetectionTimeout { timeout_ms: u64 },

    #[error("Agent reported an error: {0}")]
    ExplicitError(String),

    #[error("Usage limit reached: {0}")]
    UsageLimit(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("Queue was stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("History store failed: {0}")]
    History(String),

    #[error(transparent)]
    Transition(#[from] crate::models::state_machine::StateTransitionError),
}

impl PilotError {
    /// Task-level classification recorded on a failed task
    pub fn task_error_kind(&self) -> TaskErrorKind {
        match self {
            PilotError::Spawn { .. } => TaskErrorKind::Spawn,
            PilotError::Dependency { .. } => TaskErrorKind::Dependency,
            PilotError::SessionCrash { .. } | PilotError::NoSession => TaskErrorKind::SessionCrash,
            PilotError::SessionNotReady { .. } => TaskErrorKind::SessionNotReady,
            PilotError::Send(_) => TaskErrorKind::Send,
            PilotError::DetectionTimeout { .. } => TaskErrorKind::DetectionTimeout,
            PilotError::ExplicitError(_) => TaskErrorKind::ExplicitError,
            PilotError::UsageLimit(_) | PilotError::Stopped => TaskErrorKind::UsageLimit,
            PilotError::AuthError(_) => TaskErrorKind::Auth,
            PilotError::HealthCheckFailure(_) => TaskErrorKind::HealthCheck,
            PilotError::Config(_) | PilotError::History(_) | PilotError::Transition(_) => {
                TaskErrorKind::Interrupted
            }
        }
    }

    /// Errors that must be shown to the user right away when they started a
    /// session by hand, instead of being folded into a task
    pub fn is_foreground(&self) -> bool {
        matches!(self, PilotError::Spawn { .. } | PilotError::Dependency { .. })
    }
}

pub type PilotResult<T> = Result<T, PilotError>;
