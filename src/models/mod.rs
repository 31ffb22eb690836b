// Data models shared by the queue, the session supervisor and the event surface

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a task ended in the error state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The subprocess could not be started
    Spawn,
    /// The agent CLI is not installed
    Dependency,
    /// The subprocess exited while the task was in flight
    SessionCrash,
    /// The session never became ready
    SessionNotReady,
    /// Writing the payload to the subprocess failed
    Send,
    /// No completion signal before the hard timeout
    DetectionTimeout,
    /// The output contained an explicit error string
    ExplicitError,
    /// The agent reported an authentication failure
    Auth,
    /// The health monitor found the subprocess dead
    HealthCheck,
    /// The queue was stopped while the task was paused on a usage limit
    UsageLimit,
    /// The task was in flight when the previous run ended
    Interrupted,
}

impl TaskErrorKind {
    /// Whether re-enqueueing the same text has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TaskErrorKind::Auth | TaskErrorKind::Dependency | TaskErrorKind::ExplicitError
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Clean output captured when the task resolved
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<TaskErrorKind>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        state_machine::is_terminal_state(self.status)
    }
}

/// Permission mode the agent CLI is launched with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Agent asks before edits and commands
    #[default]
    Default,
    /// File edits are accepted automatically
    AcceptEdits,
    /// All permission prompts are skipped
    SkipPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept_edits",
            PermissionMode::SkipPermissions => "skip_permissions",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "default" => Ok(PermissionMode::Default),
            "accept_edits" => Ok(PermissionMode::AcceptEdits),
            "skip_permissions" | "skip" => Ok(PermissionMode::SkipPermissions),
            _ => Err(format!(
                "Unknown permission mode: '{}'. Expected one of: default, accept_edits, skip_permissions",
                s
            )),
        }
    }
}

/// Keys that can be forwarded to the interactive subprocess
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyInput {
    Up,
    Down,
    Left,
    Right,
    Enter,
    Escape,
}

impl KeyInput {
    /// Byte sequence a terminal sends for this key
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            KeyInput::Up => b"\x1b[A",
            KeyInput::Down => b"\x1b[B",
            KeyInput::Right => b"\x1b[C",
            KeyInput::Left => b"\x1b[D",
            KeyInput::Enter => b"\r",
            KeyInput::Escape => b"\x1b",
        }
    }
}

impl std::str::FromStr for KeyInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(KeyInput::Up),
            "down" => Ok(KeyInput::Down),
            "left" => Ok(KeyInput::Left),
            "right" => Ok(KeyInput::Right),
            "enter" | "return" => Ok(KeyInput::Enter),
            "escape" | "esc" => Ok(KeyInput::Escape),
            _ => Err(format!("Unknown key: '{}'", s)),
        }
    }
}
