//! Drives the task queue through the session one task at a time

use super::store::TaskQueue;
use crate::config::{DetectionConfig, PilotConfig, QueueConfig};
use crate::detection::{CompletionDetector, Verdict};
use crate::errors::{PilotError, PilotResult};
use crate::events::{EventBroadcaster, UsageLimitPayload, EVENT_USAGE_LIMIT};
use crate::history::TaskHistory;
use crate::interceptor::{Interception, UsageLimitInfo, UsageLimitInterceptor};
use crate::models::{PermissionMode, Task, TaskStatus};
use crate::patterns::PatternSet;
use crate::session::{SessionEvent, SessionSupervisor};
use crate::utils::{chunk_text, lock_mutex_recover, truncate_for_log};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How a dispatched task ended
enum Resolution {
    Done(String),
    Failed(PilotError),
    UsageLimited(UsageLimitInfo),
}

struct OrchestratorInner {
    queue: TaskQueue,
    supervisor: SessionSupervisor,
    patterns: Arc<PatternSet>,
    interceptor: UsageLimitInterceptor,
    detection: DetectionConfig,
    settings: QueueConfig,
    events: EventBroadcaster,
    mode: Mutex<PermissionMode>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct QueueOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl QueueOrchestrator {
    pub fn new(
        config: &PilotConfig,
        patterns: Arc<PatternSet>,
        queue: TaskQueue,
        supervisor: SessionSupervisor,
    ) -> Self {
        let interceptor = UsageLimitInterceptor::new(
            patterns.clone(),
            Duration::from_millis(config.usage_limit.recency_window_ms),
        );
        let events = queue.events().clone();
        Self {
            inner: Arc::new(OrchestratorInner {
                queue,
                supervisor,
                patterns,
                interceptor,
                detection: config.detection.clone(),
                settings: config.queue.clone(),
                events,
                mode: Mutex::new(config.queue.permission_mode),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn enqueue(&self, text: &str) -> Option<Task> {
        self.inner.queue.enqueue(text)
    }

    /// First pending task in submission order
    pub fn next(&self) -> Option<Task> {
        self.inner.queue.next_pending()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.inner.queue.snapshot()
    }

    /// Replay a previous run's tasks into the queue
    pub fn restore(&self, history: &dyn TaskHistory) -> anyhow::Result<usize> {
        let tasks = history.load()?;
        let count = self.inner.queue.restore(tasks);
        log::info!("[QueueOrchestrator] Restored {} tasks from history", count);
        Ok(count)
    }

    /// Start processing. A running drive loop just picks up the new mode.
    pub fn start(&self, mode: PermissionMode) {
        *lock_mutex_recover(&self.inner.mode) = mode;
        self.inner.queue.set_running(true);

        let mut driver = lock_mutex_recover(&self.inner.driver);
        if driver.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            log::debug!("[QueueOrchestrator] Drive loop already running");
            return;
        }
        log::info!("[QueueOrchestrator] Starting queue (mode {})", mode);
        *driver = Some(tokio::spawn(drive(self.inner.clone())));
    }

    /// Cooperative stop: the task in flight finishes, nothing new starts.
    /// A task held by a usage-limit pause is failed.
    pub fn stop(&self) {
        log::info!("[QueueOrchestrator] Stopping queue");
        self.inner.queue.set_running(false);
        if self.inner.queue.is_paused() {
            if let Some(task) = self.inner.queue.fail_processing(&PilotError::Stopped) {
                log::warn!(
                    "[QueueOrchestrator] Queue stopped while task {} was held by a usage limit",
                    task.id
                );
            }
            self.inner.queue.set_paused(false);
        }
    }

    /// Leave a usage-limit pause and re-dispatch the held task
    pub fn resume(&self) -> bool {
        if !self.inner.queue.is_paused() {
            return false;
        }
        log::info!("[QueueOrchestrator] Resuming queue");
        self.inner.queue.set_paused(false);
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.queue.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.queue.is_paused()
    }

    /// Nothing pending and nothing processing
    pub fn is_drained(&self) -> bool {
        !self.inner.queue.has_pending() && self.inner.queue.processing().is_none()
    }

    /// Whether the drive loop task is alive
    pub fn is_driving(&self) -> bool {
        lock_mutex_recover(&self.inner.driver)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }
}

async fn drive(inner: Arc<OrchestratorInner>) {
    log::debug!("[QueueOrchestrator] Drive loop started");
    loop {
        if !inner.queue.is_running() {
            // Re-checked under the driver lock so a concurrent start() is not lost
            let mut driver = lock_mutex_recover(&inner.driver);
            if inner.queue.is_running() {
                continue;
            }
            driver.take();
            break;
        }

        if inner.queue.is_paused() {
            inner.queue.changed().await;
            continue;
        }

        let Some(task) = inner.queue.next_pending() else {
            inner.queue.changed().await;
            continue;
        };

        inner.run_task(task).await;
        inner.queue.prune(
            Duration::from_secs(inner.settings.retention_secs),
            inner.settings.max_finished,
        );
        tokio::time::sleep(Duration::from_millis(inner.settings.cooldown_ms)).await;
    }
    log::info!("[QueueOrchestrator] Drive loop stopped");
}

impl OrchestratorInner {
    fn mode(&self) -> PermissionMode {
        *lock_mutex_recover(&self.mode)
    }

    async fn run_task(&self, task: Task) {
        log::info!(
            "[QueueOrchestrator] Next task {}: {}",
            task.id,
            truncate_for_log(&task.text, 80)
        );

        if let Err(e) = self.supervisor.ensure_ready(self.mode()).await {
            log::error!("[QueueOrchestrator] Session unavailable for task {}: {}", task.id, e);
            self.resolve_failed(&task.id, &e);
            return;
        }

        let task = match self.queue.mark_processing(&task.id) {
            Ok(task) => task,
            Err(e) => {
                log::warn!("[QueueOrchestrator] Cannot dispatch task {}: {}", task.id, e);
                return;
            }
        };

        let hung = match self.dispatch(&task).await {
            Ok(output) => {
                if let Err(e) = self.queue.complete(&task.id, Some(output)) {
                    log::warn!("[QueueOrchestrator] Task {} already resolved: {}", task.id, e);
                }
                false
            }
            Err(e) => {
                self.resolve_failed(&task.id, &e);
                matches!(e, PilotError::DetectionTimeout { .. })
            }
        };

        if hung {
            log::warn!("[QueueOrchestrator] Recycling session after task {} timed out", task.id);
            self.supervisor.reset(true);
        } else if self.settings.fresh_session {
            log::debug!("[QueueOrchestrator] Recycling session after task {}", task.id);
            self.supervisor.reset(true);
        }
    }

    fn resolve_failed(&self, task_id: &str, error: &PilotError) {
        // The crash and health paths may have failed the task already
        if let Err(e) = self.queue.fail(task_id, error) {
            log::debug!("[QueueOrchestrator] Task {} already resolved: {}", task_id, e);
        }
    }

    /// Send the task and wait for its resolution. A usage limit holds the
    /// task until the queue is resumed or stopped.
    async fn dispatch(&self, task: &Task) -> PilotResult<String> {
        loop {
            let session_id = self.supervisor.session_id().ok_or(PilotError::NoSession)?;
            let mut output = self.supervisor.subscribe_output();
            let mut session_events = self.supervisor.subscribe_events();

            self.send_payload(&task.text).await?;
            let dispatched_at = Instant::now();

            let resolution = self
                .await_resolution(
                    task,
                    &session_id,
                    dispatched_at,
                    &mut output,
                    &mut session_events,
                )
                .await;

            match resolution {
                Resolution::Done(captured) => return Ok(captured),
                Resolution::Failed(e) => return Err(e),
                Resolution::UsageLimited(info) => {
                    self.pause_for_limit(task, info);
                    if !self.wait_for_resume().await {
                        return Err(PilotError::Stopped);
                    }

                    // stop() fails the held task itself; a quick restart must not revive it
                    let still_held = self
                        .queue
                        .get(&task.id)
                        .map(|t| t.status == TaskStatus::Processing)
                        .unwrap_or(false);
                    if !still_held {
                        return Err(PilotError::Stopped);
                    }
                    log::info!("[QueueOrchestrator] Re-dispatching task {}", task.id);
                    self.supervisor.ensure_ready(self.mode()).await?;
                }
            }
        }
    }

    /// Write the payload in bounded chunks, then confirm it
    async fn send_payload(&self, text: &str) -> PilotResult<()> {
        let chunks = chunk_text(text, self.settings.chunk_size);
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.supervisor.send(chunk.as_bytes()).await?;
            if i + 1 < count {
                tokio::time::sleep(Duration::from_millis(self.settings.chunk_delay_ms)).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(self.settings.confirm_delay_ms)).await;
        self.supervisor.send(b"\r").await
    }

    async fn await_resolution(
        &self,
        task: &Task,
        session_id: &str,
        dispatched_at: Instant,
        output: &mut broadcast::Receiver<crate::output::OutputChunk>,
        session_events: &mut broadcast::Receiver<SessionEvent>,
    ) -> Resolution {
        let mut detector = CompletionDetector::new(
            &task.text,
            self.patterns.clone(),
            &self.detection,
            dispatched_at,
        );
        let mut ticker = tokio::time::interval(self.detection.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Ok(chunk) => {
                        match self.interceptor.check(&chunk.text, &task.text, dispatched_at, chunk.received_at) {
                            Interception::UsageLimit(info) => return Resolution::UsageLimited(info),
                            Interception::AuthError(matched) => {
                                return Resolution::Failed(PilotError::AuthError(matched));
                            }
                            Interception::None => {}
                        }
                        detector.ingest(&chunk);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("[QueueOrchestrator] Output lagged, skipped {} chunks", skipped);
                    }
                    Err(RecvError::Closed) => return Resolution::Failed(PilotError::NoSession),
                },
                event = session_events.recv() => match event {
                    Ok(SessionEvent::Exited { session_id: id, exit_code, intentional }) if id == session_id => {
                        return Resolution::Failed(if intentional {
                            PilotError::NoSession
                        } else {
                            PilotError::SessionCrash { exit_code }
                        });
                    }
                    Ok(SessionEvent::Unhealthy { session_id: id, reason }) if id == session_id => {
                        return Resolution::Failed(PilotError::HealthCheckFailure(reason));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Resolution::Failed(PilotError::NoSession),
                },
                _ = ticker.tick() => match detector.poll(Instant::now()) {
                    Verdict::Success(signal) => {
                        log::info!(
                            "[QueueOrchestrator] Task {} completed ({} after {}s)",
                            task.id,
                            signal,
                            dispatched_at.elapsed().as_secs()
                        );
                        return Resolution::Done(detector.captured_output());
                    }
                    Verdict::Failure(message) => {
                        return Resolution::Failed(PilotError::ExplicitError(message));
                    }
                    Verdict::TimedOut => {
                        return Resolution::Failed(PilotError::DetectionTimeout {
                            timeout_ms: self.detection.task_timeout_ms,
                        });
                    }
                    _ => {}
                },
            }
        }
    }

    fn pause_for_limit(&self, task: &Task, info: UsageLimitInfo) {
        log::warn!(
            "[QueueOrchestrator] Pausing queue: usage limit while running task {} ({})",
            task.id,
            info.matched_pattern
        );
        self.queue.set_paused(true);
        self.events.broadcast(
            EVENT_USAGE_LIMIT,
            UsageLimitPayload {
                task_id: task.id.clone(),
                kind: info.kind,
                matched_pattern: info.matched_pattern,
                retry_after_secs: info.retry_after_secs,
                reset_hint: info.reset_hint,
                detected_at: info.detected_at,
            },
        );
    }

    /// True on resume, false when the queue is stopped first
    async fn wait_for_resume(&self) -> bool {
        loop {
            if !self.queue.is_running() {
                return false;
            }
            if !self.queue.is_paused() {
                return true;
            }
            self.queue.changed().await;
        }
    }
}
