//! Owns the single interactive agent session
//!
//! The supervisor spawns the agent in a terminal, pumps its output through
//! the classifier into a broadcast channel, decides when the interface is
//! ready for input, and tears the session down on stop, crash, or a failed
//! health probe. A crash or failed probe fails the task that was processing.

use super::path_resolver::{CliPathResolver, CommandResolver};
use super::process::{ProcessHandle, ProcessSpawner, SpawnRequest};
use super::pty::PtySpawner;
use crate::config::SessionConfig;
use crate::errors::{PilotError, PilotResult};
use crate::events::{
    EventBroadcaster, SessionStatus, SessionUnhealthyPayload, EVENT_SESSION_UNHEALTHY,
};
use crate::health::{HealthMonitor, LivenessProbe};
use crate::models::{KeyInput, PermissionMode};
use crate::output::{OutputChunk, OutputClassifier};
use crate::queue::TaskQueue;
use crate::utils::lock_mutex_recover;
use std::io::Write;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How often readiness is re-checked while waiting
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the pump waits for an exit code after the terminal closes
const EXIT_REAP_ATTEMPTS: u32 = 10;
const EXIT_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle notifications for in-process consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        session_id: String,
    },
    Ready {
        session_id: String,
    },
    Exited {
        session_id: String,
        exit_code: Option<i32>,
        intentional: bool,
    },
    Unhealthy {
        session_id: String,
        reason: String,
    },
}

struct ActiveSession {
    id: String,
    mode: PermissionMode,
    handle: Box<dyn ProcessHandle>,
    writer: Arc<AsyncMutex<Box<dyn Write + Send>>>,
    spawned_at: Instant,
    first_output_at: Option<Instant>,
    last_activity: Instant,
    writable: bool,
    ready_announced: bool,
    pump: Option<JoinHandle<()>>,
    health: Option<HealthMonitor>,
}

impl ActiveSession {
    fn is_alive(&mut self) -> bool {
        matches!(self.handle.try_wait(), Ok(None))
    }

    fn settled(&self, settle_delay: Duration, now: Instant) -> bool {
        self.first_output_at
            .map(|first| now.duration_since(first) >= settle_delay)
            .unwrap_or(false)
    }
}

struct SupervisorInner {
    config: SessionConfig,
    health_interval: Duration,
    spawner: Arc<dyn ProcessSpawner>,
    resolver: Arc<dyn CommandResolver>,
    queue: TaskQueue,
    events: EventBroadcaster,
    active: Mutex<Option<ActiveSession>>,
    start_lock: AsyncMutex<()>,
    output_tx: broadcast::Sender<OutputChunk>,
    session_tx: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SessionSupervisor {
    pub fn new(
        config: SessionConfig,
        health_interval: Duration,
        queue: TaskQueue,
        events: EventBroadcaster,
        spawner: Arc<dyn ProcessSpawner>,
        resolver: Arc<dyn CommandResolver>,
    ) -> Self {
        let (output_tx, _) = broadcast::channel(1024);
        let (session_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                health_interval,
                spawner,
                resolver,
                queue,
                events,
                active: Mutex::new(None),
                start_lock: AsyncMutex::new(()),
                output_tx,
                session_tx,
            }),
        }
    }

    /// Supervisor backed by a real terminal and the standard path lookup
    pub fn with_pty(
        config: SessionConfig,
        health_interval: Duration,
        queue: TaskQueue,
        events: EventBroadcaster,
    ) -> Self {
        Self::new(
            config,
            health_interval,
            queue,
            events,
            Arc::new(PtySpawner),
            Arc::new(CliPathResolver),
        )
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.inner.output_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_tx.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_active(&self) -> bool {
        lock_mutex_recover(&self.inner.active).is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        lock_mutex_recover(&self.inner.active)
            .as_ref()
            .map(|s| s.id.clone())
    }

    pub fn permission_mode(&self) -> Option<PermissionMode> {
        lock_mutex_recover(&self.inner.active).as_ref().map(|s| s.mode)
    }

    pub fn pid(&self) -> Option<u32> {
        lock_mutex_recover(&self.inner.active)
            .as_ref()
            .and_then(|s| s.handle.pid())
    }

    /// Last time output arrived or input was written
    pub fn last_activity(&self) -> Option<Instant> {
        lock_mutex_recover(&self.inner.active)
            .as_ref()
            .map(|s| s.last_activity)
    }

    /// Alive, writable, and quiet for the settle delay after its first output
    pub fn is_ready(&self) -> bool {
        let announce = {
            let mut active = lock_mutex_recover(&self.inner.active);
            let Some(session) = active.as_mut() else {
                return false;
            };
            let ready = session.writable
                && session.settled(self.inner.config.settle_delay(), Instant::now())
                && session.is_alive();
            if !ready {
                return false;
            }
            if session.ready_announced {
                None
            } else {
                session.ready_announced = true;
                Some(session.id.clone())
            }
        };

        if let Some(session_id) = announce {
            log::info!("[SessionSupervisor] Session {} is ready", session_id);
            self.inner
                .events
                .emit_session_status(&session_id, SessionStatus::Ready, None);
            let _ = self
                .inner
                .session_tx
                .send(SessionEvent::Ready { session_id });
        }
        true
    }

    pub fn is_healthy(&self) -> bool {
        let mut active = lock_mutex_recover(&self.inner.active);
        match active.as_mut() {
            Some(session) => session.writable && session.is_alive(),
            None => false,
        }
    }

    /// Spawn a session if none is active. Concurrent calls spawn at most one.
    pub async fn start(&self, mode: PermissionMode) -> PilotResult<()> {
        let _guard = self.inner.start_lock.lock().await;
        if let Some(existing) = self.session_id() {
            log::debug!(
                "[SessionSupervisor] Session {} already active, start is a no-op",
                existing
            );
            return Ok(());
        }

        let config = &self.inner.config;
        let program = self
            .inner
            .resolver
            .resolve(&config.command)
            .ok_or_else(|| PilotError::Dependency {
                tool: config.command.clone(),
                hint: CliPathResolver::install_hint(&config.command),
            })?;

        let request = SpawnRequest {
            program,
            args: config.args_for(mode),
            rows: config.rows,
            cols: config.cols,
            working_dir: config.working_dir.clone(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        };
        let spawned = self.inner.spawner.spawn(&request)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        log::info!(
            "[SessionSupervisor] Started session {} ({:?}, mode {})",
            session_id,
            request.program,
            mode
        );

        // Register before the pump runs so no output is attributed to nothing
        {
            let mut active = lock_mutex_recover(&self.inner.active);
            *active = Some(ActiveSession {
                id: session_id.clone(),
                mode,
                handle: spawned.handle,
                writer: Arc::new(AsyncMutex::new(spawned.input)),
                spawned_at: now,
                first_output_at: None,
                last_activity: now,
                writable: true,
                ready_announced: false,
                pump: None,
                health: None,
            });
        }

        let pump = tokio::spawn(run_pump(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            spawned.output,
        ));
        let probe = Arc::new(SessionProbe {
            inner: Arc::downgrade(&self.inner),
            session_id: session_id.clone(),
        });
        let health = HealthMonitor::start(probe, self.inner.health_interval);

        {
            let mut active = lock_mutex_recover(&self.inner.active);
            match active.as_mut() {
                Some(session) if session.id == session_id => {
                    session.pump = Some(pump);
                    session.health = Some(health);
                }
                // Already gone; the pump is finishing on its own
                _ => drop(health),
            }
        }

        self.inner
            .events
            .emit_session_status(&session_id, SessionStatus::Starting, None);
        let _ = self
            .inner
            .session_tx
            .send(SessionEvent::Started { session_id });
        Ok(())
    }

    /// Poll readiness until `timeout` elapses
    pub async fn wait_ready(&self, timeout: Duration) -> PilotResult<()> {
        let started = Instant::now();
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if !self.is_active() {
                return Err(PilotError::NoSession);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                log::warn!(
                    "[SessionSupervisor] Session not ready after {}ms",
                    waited.as_millis()
                );
                return Err(PilotError::SessionNotReady {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Start a session if needed and wait until it accepts input
    pub async fn ensure_ready(&self, mode: PermissionMode) -> PilotResult<()> {
        self.start(mode).await?;
        self.wait_ready(self.inner.config.ready_timeout()).await
    }

    /// Write raw bytes to the session input
    pub async fn send(&self, bytes: &[u8]) -> PilotResult<()> {
        let (session_id, writer) = {
            let active = lock_mutex_recover(&self.inner.active);
            let session = active.as_ref().ok_or(PilotError::NoSession)?;
            if !session.writable {
                return Err(PilotError::Send("session input is closed".to_string()));
            }
            (session.id.clone(), session.writer.clone())
        };

        let result = {
            let mut writer = writer.lock().await;
            writer.write_all(bytes).and_then(|_| writer.flush())
        };

        let mut active = lock_mutex_recover(&self.inner.active);
        let session = active.as_mut().filter(|s| s.id == session_id);
        match result {
            Ok(()) => {
                if let Some(session) = session {
                    session.last_activity = Instant::now();
                }
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "[SessionSupervisor] Write to session {} failed: {}",
                    session_id,
                    e
                );
                if let Some(session) = session {
                    session.writable = false;
                }
                Err(PilotError::Send(e.to_string()))
            }
        }
    }

    pub async fn send_key(&self, key: KeyInput) -> PilotResult<()> {
        log::debug!("[SessionSupervisor] Forwarding key {:?}", key);
        self.send(key.as_bytes()).await
    }

    /// Terminate the session on purpose. Returns false if none was active.
    pub fn stop(&self) -> bool {
        let Some(mut session) = lock_mutex_recover(&self.inner.active).take() else {
            return false;
        };

        if let Some(mut health) = session.health.take() {
            health.stop();
        }
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        if let Err(e) = session.handle.kill() {
            log::debug!(
                "[SessionSupervisor] Kill for session {} returned: {}",
                session.id,
                e
            );
        }

        log::info!(
            "[SessionSupervisor] Stopped session {} after {}s",
            session.id,
            session.spawned_at.elapsed().as_secs()
        );
        self.inner
            .events
            .emit_session_status(&session.id, SessionStatus::Stopped, None);
        let _ = self.inner.session_tx.send(SessionEvent::Exited {
            session_id: session.id,
            exit_code: None,
            intentional: true,
        });
        true
    }

    /// Stop the session. Unless `keep_processing`, the queue is halted too.
    pub fn reset(&self, keep_processing: bool) {
        self.stop();
        if !keep_processing {
            self.inner.queue.set_running(false);
        }
    }
}

impl SupervisorInner {
    fn record_output(&self, session_id: &str) {
        let mut active = lock_mutex_recover(&self.active);
        if let Some(session) = active.as_mut().filter(|s| s.id == session_id) {
            let now = Instant::now();
            session.first_output_at.get_or_insert(now);
            session.last_activity = now;
        }
    }

    /// Take the session out of the slot if it is still the one given
    fn take_session(&self, session_id: &str) -> Option<ActiveSession> {
        let mut active = lock_mutex_recover(&self.active);
        if active.as_ref().map(|s| s.id == session_id).unwrap_or(false) {
            active.take()
        } else {
            None
        }
    }

    /// Called by the pump once the terminal has closed
    async fn reap(&self, session_id: &str) {
        let mut exit_code = None;
        for _ in 0..EXIT_REAP_ATTEMPTS {
            let status = {
                let mut active = lock_mutex_recover(&self.active);
                match active.as_mut().filter(|s| s.id == session_id) {
                    Some(session) => session.handle.try_wait(),
                    // Stopped on purpose
                    None => return,
                }
            };
            match status {
                Ok(Some(code)) => {
                    exit_code = Some(code);
                    break;
                }
                Ok(None) => tokio::time::sleep(EXIT_REAP_INTERVAL).await,
                Err(e) => {
                    log::debug!("[SessionSupervisor] try_wait failed: {}", e);
                    break;
                }
            }
        }
        self.handle_exit(session_id, exit_code);
    }

    fn handle_exit(&self, session_id: &str, exit_code: Option<i32>) {
        let Some(mut session) = self.take_session(session_id) else {
            return;
        };
        if let Some(mut health) = session.health.take() {
            health.stop();
        }
        // The terminal is gone even if the process lingers
        if exit_code.is_none() {
            let _ = session.handle.kill();
        }

        log::warn!(
            "[SessionSupervisor] Session {} exited unexpectedly (exit code {:?})",
            session_id,
            exit_code
        );
        if let Some(task) = self
            .queue
            .fail_processing(&PilotError::SessionCrash { exit_code })
        {
            log::warn!(
                "[SessionSupervisor] Task {} failed because the session crashed",
                task.id
            );
        }
        self.events
            .emit_session_status(session_id, SessionStatus::Crashed, exit_code);
        let _ = self.session_tx.send(SessionEvent::Exited {
            session_id: session_id.to_string(),
            exit_code,
            intentional: false,
        });
    }

    fn mark_unhealthy(&self, session_id: &str, reason: String) {
        let Some(mut session) = self.take_session(session_id) else {
            return;
        };
        // Called from the monitor's own task, which ends by itself
        if let Some(health) = session.health.take() {
            health.detach();
        }
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        let _ = session.handle.kill();

        log::error!(
            "[SessionSupervisor] Session {} is unhealthy: {}",
            session_id,
            reason
        );
        let failed = self
            .queue
            .fail_processing(&PilotError::HealthCheckFailure(reason.clone()));
        self.events.broadcast(
            EVENT_SESSION_UNHEALTHY,
            SessionUnhealthyPayload {
                session_id: session_id.to_string(),
                reason: reason.clone(),
                failed_task_id: failed.map(|t| t.id),
            },
        );
        self.events
            .emit_session_status(session_id, SessionStatus::Unhealthy, None);
        let _ = self.session_tx.send(SessionEvent::Unhealthy {
            session_id: session_id.to_string(),
            reason,
        });
    }
}

async fn run_pump(
    inner: Weak<SupervisorInner>,
    session_id: String,
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut classifier = OutputClassifier::new();
    while let Some(raw) = output.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let classified = classifier.normalize(&raw);
        inner.record_output(&session_id);
        // No subscribers is fine
        let _ = inner
            .output_tx
            .send(OutputChunk::new(classified, raw.len()));
    }

    log::debug!("[SessionSupervisor] Output closed for session {}", session_id);
    if let Some(inner) = inner.upgrade() {
        inner.reap(&session_id).await;
    }
}

struct SessionProbe {
    inner: Weak<SupervisorInner>,
    session_id: String,
}

impl LivenessProbe for SessionProbe {
    fn claims_ready(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let active = lock_mutex_recover(&inner.active);
        active
            .as_ref()
            .filter(|s| s.id == self.session_id)
            .map(|s| s.settled(inner.config.settle_delay(), Instant::now()))
            .unwrap_or(false)
    }

    fn probe(&self) -> Result<(), String> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let mut active = lock_mutex_recover(&inner.active);
        let Some(session) = active.as_mut().filter(|s| s.id == self.session_id) else {
            return Ok(());
        };
        match session.handle.try_wait() {
            Ok(Some(code)) => Err(format!("process exited with code {}", code)),
            Err(e) => Err(format!("cannot query process: {}", e)),
            Ok(None) if !session.writable => Err("input channel is closed".to_string()),
            Ok(None) => Ok(()),
        }
    }

    fn mark_unhealthy(&self, reason: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.mark_unhealthy(&self.session_id, reason);
        }
    }
}
