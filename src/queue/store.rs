//! Shared FIFO task list
//!
//! Every status change goes through this type so the "one task processing"
//! rule is checked under a single lock. Changes are broadcast and forwarded
//! to the history store after the lock is released.

use crate::errors::PilotError;
use crate::events::{EventBroadcaster, QueueSnapshotPayload, EVENT_QUEUE_UPDATED};
use crate::history::TaskHistory;
use crate::models::state_machine::{transition_state, StateTransitionError};
use crate::models::{Task, TaskErrorKind, TaskStatus};
use crate::utils::lock_mutex_recover;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueInner {
    tasks: Mutex<Vec<Task>>,
    running: AtomicBool,
    paused: AtomicBool,
    changed: Notify,
    events: EventBroadcaster,
    history: Option<Arc<dyn TaskHistory>>,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(events: EventBroadcaster) -> Self {
        Self::build(events, None)
    }

    pub fn with_history(events: EventBroadcaster, history: Arc<dyn TaskHistory>) -> Self {
        Self::build(events, Some(history))
    }

    fn build(events: EventBroadcaster, history: Option<Arc<dyn TaskHistory>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                changed: Notify::new(),
                events,
                history,
            }),
        }
    }

    /// Append a task. Blank text is ignored.
    pub fn enqueue(&self, text: &str) -> Option<Task> {
        let text = text.trim();
        if text.is_empty() {
            log::debug!("[TaskQueue] Ignoring empty task");
            return None;
        }

        let task = Task::new(text);
        lock_mutex_recover(&self.inner.tasks).push(task.clone());
        log::info!("[TaskQueue] Enqueued task {}", task.id);

        self.persist(&task);
        self.publish();
        self.inner.changed.notify_one();
        Some(task)
    }

    /// First pending task in submission order
    pub fn next_pending(&self) -> Option<Task> {
        lock_mutex_recover(&self.inner.tasks)
            .iter()
            .find(|t| t.status == TaskStatus::Pending)
            .cloned()
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    /// The task currently in flight, if any
    pub fn processing(&self) -> Option<Task> {
        lock_mutex_recover(&self.inner.tasks)
            .iter()
            .find(|t| t.status == TaskStatus::Processing)
            .cloned()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        lock_mutex_recover(&self.inner.tasks)
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        lock_mutex_recover(&self.inner.tasks).clone()
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.inner.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a pending task to processing. Refused while another task is
    /// processing.
    pub fn mark_processing(&self, task_id: &str) -> Result<Task, StateTransitionError> {
        let task = {
            let mut tasks = lock_mutex_recover(&self.inner.tasks);
            if let Some(active) = tasks
                .iter()
                .find(|t| t.status == TaskStatus::Processing && t.id != task_id)
            {
                return Err(StateTransitionError::AlreadyProcessing(active.id.clone()));
            }

            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| StateTransitionError::NotFound(task_id.to_string()))?;
            task.status = transition_state(task.status, TaskStatus::Processing)?;
            task.started_at = Some(Utc::now());
            task.clone()
        };

        log::info!("[TaskQueue] Task {} is processing", task.id);
        self.after_transition(&task, TaskStatus::Pending);
        Ok(task)
    }

    pub fn complete(
        &self,
        task_id: &str,
        output: Option<String>,
    ) -> Result<Task, StateTransitionError> {
        let (task, old) = self.update(task_id, TaskStatus::Completed, |task| {
            task.output = output;
        })?;
        log::info!("[TaskQueue] Task {} completed", task.id);
        self.after_transition(&task, old);
        Ok(task)
    }

    pub fn fail(&self, task_id: &str, error: &PilotError) -> Result<Task, StateTransitionError> {
        self.fail_with(task_id, error.to_string(), error.task_error_kind())
    }

    pub fn fail_with(
        &self,
        task_id: &str,
        message: String,
        kind: TaskErrorKind,
    ) -> Result<Task, StateTransitionError> {
        let (task, old) = self.update(task_id, TaskStatus::Error, |task| {
            task.error = Some(message);
            task.error_kind = Some(kind);
        })?;
        log::warn!(
            "[TaskQueue] Task {} failed ({:?}): {}",
            task.id,
            kind,
            task.error.as_deref().unwrap_or_default()
        );
        self.after_transition(&task, old);
        Ok(task)
    }

    /// Fail whichever task is processing. Used by the crash and health paths.
    pub fn fail_processing(&self, error: &PilotError) -> Option<Task> {
        let active = self.processing()?;
        self.fail(&active.id, error).ok()
    }

    /// Drop terminal tasks older than `retention`, then keep at most
    /// `max_finished` of the newest terminal tasks. Returns how many were
    /// removed.
    pub fn prune(&self, retention: Duration, max_finished: usize) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(365));

        let removed = {
            let mut tasks = lock_mutex_recover(&self.inner.tasks);
            let before = tasks.len();
            tasks.retain(|t| !t.is_terminal() || t.completed_at.unwrap_or(t.created_at) >= cutoff);

            let finished = tasks.iter().filter(|t| t.is_terminal()).count();
            let mut excess = finished.saturating_sub(max_finished);
            if excess > 0 {
                tasks.retain(|t| {
                    if excess > 0 && t.is_terminal() {
                        excess -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
            before - tasks.len()
        };

        if removed > 0 {
            log::debug!("[TaskQueue] Pruned {} finished tasks", removed);
            self.publish();
        }
        removed
    }

    /// Load tasks from a previous run. Tasks that were processing when the
    /// run ended are failed as interrupted; pending tasks keep their order.
    pub fn restore(&self, tasks: Vec<Task>) -> usize {
        let mut interrupted = Vec::new();
        let count = tasks.len();
        {
            let mut current = lock_mutex_recover(&self.inner.tasks);
            for mut task in tasks {
                if current.iter().any(|t| t.id == task.id) {
                    continue;
                }
                if task.status == TaskStatus::Processing {
                    task.status = TaskStatus::Error;
                    task.error = Some("interrupted".to_string());
                    task.error_kind = Some(TaskErrorKind::Interrupted);
                    task.completed_at = Some(Utc::now());
                    interrupted.push(task.clone());
                }
                current.push(task);
            }
        }

        for task in &interrupted {
            log::warn!("[TaskQueue] Task {} was interrupted by the previous run", task.id);
            self.after_transition(task, TaskStatus::Processing);
        }
        self.publish();
        self.inner.changed.notify_one();
        count
    }

    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::SeqCst);
        self.inner.changed.notify_one();
        self.publish();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::SeqCst);
        self.inner.changed.notify_one();
        self.publish();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Resolves after the next enqueue, restore, or run-state change
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    fn update<F>(
        &self,
        task_id: &str,
        target: TaskStatus,
        apply: F,
    ) -> Result<(Task, TaskStatus), StateTransitionError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = lock_mutex_recover(&self.inner.tasks);
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StateTransitionError::NotFound(task_id.to_string()))?;
        let old = task.status;
        task.status = transition_state(old, target)?;
        task.completed_at = Some(Utc::now());
        apply(task);
        Ok((task.clone(), old))
    }

    fn after_transition(&self, task: &Task, old_status: TaskStatus) {
        self.inner.events.emit_task_status(task, old_status);
        self.persist(task);
        self.publish();
    }

    fn persist(&self, task: &Task) {
        if let Some(history) = &self.inner.history {
            if let Err(e) = history.append_or_update(task) {
                log::error!("[TaskQueue] Failed to persist task {}: {:#}", task.id, e);
            }
        }
    }

    fn publish(&self) {
        let payload = QueueSnapshotPayload {
            tasks: self.snapshot(),
            running: self.is_running(),
            paused: self.is_paused(),
        };
        self.inner.events.broadcast(EVENT_QUEUE_UPDATED, payload);
    }
}
