// Event types and payload structures for the display/control surface
// These are broadcast to every subscriber as named JSON events

use crate::models::{Task, TaskErrorKind, TaskStatus};
use crate::patterns::UsageLimitKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// Event name constants
pub const EVENT_QUEUE_UPDATED: &str = "queue:updated";
pub const EVENT_TASK_STATUS_CHANGED: &str = "task:status_changed";
pub const EVENT_OUTPUT_LOG: &str = "output:log";
pub const EVENT_OUTPUT_LIVE: &str = "output:live";
pub const EVENT_USAGE_LIMIT: &str = "queue:usage_limit";
pub const EVENT_SESSION_STATUS_CHANGED: &str = "session:status_changed";
pub const EVENT_SESSION_UNHEALTHY: &str = "session:unhealthy";

/// Payload for queue snapshot events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshotPayload {
    pub tasks: Vec<Task>,
    pub running: bool,
    pub paused: bool,
}

/// Payload for task status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusChangedPayload {
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<TaskErrorKind>,
}

/// Payload for output events (log and live streams)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload for usage limit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitPayload {
    pub task_id: String,
    pub kind: UsageLimitKind,
    pub matched_pattern: String,
    pub retry_after_secs: Option<u64>,
    pub reset_hint: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Ready,
    Stopped,
    Crashed,
    Unhealthy,
}

/// Payload for session status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusChangedPayload {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Payload for health monitor warnings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUnhealthyPayload {
    pub session_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_task_id: Option<String>,
}

/// A named event with a JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotEvent {
    /// Event type (e.g., "task:status_changed", "output:live")
    pub event: String,
    pub payload: serde_json::Value,
}

impl PilotEvent {
    /// Decode the payload into its typed form
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Broadcasts events to every subscriber
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<PilotEvent>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster with a channel capacity of 1000 events
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    pub fn broadcast(&self, event_type: &str, payload: impl Serialize) {
        let event = PilotEvent {
            event: event_type.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        };

        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PilotEvent> {
        self.tx.subscribe()
    }

    pub fn emit_task_status(&self, task: &Task, old_status: TaskStatus) {
        self.broadcast(
            EVENT_TASK_STATUS_CHANGED,
            TaskStatusChangedPayload {
                task_id: task.id.clone(),
                old_status,
                new_status: task.status,
                error: task.error.clone(),
                error_kind: task.error_kind,
            },
        );
    }

    pub fn emit_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) {
        self.broadcast(
            EVENT_SESSION_STATUS_CHANGED,
            SessionStatusChangedPayload {
                session_id: session_id.to_string(),
                status,
                exit_code,
            },
        );
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
