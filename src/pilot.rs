//! Facade wiring the session, queue and output forwarding together

use crate::config::{ConfigError, PilotConfig};
use crate::errors::{PilotError, PilotResult};
use crate::events::{EventBroadcaster, PilotEvent};
use crate::history::TaskHistory;
use crate::models::{KeyInput, PermissionMode, Task};
use crate::output::{spawn_forwarder, OutputSink};
use crate::patterns::PatternSet;
use crate::queue::{QueueOrchestrator, TaskQueue};
use crate::session::{
    CliPathResolver, CommandResolver, ProcessSpawner, PtySpawner, SessionSupervisor,
};
use crate::shutdown::ShutdownReport;
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Everything shared between components, passed explicitly
#[derive(Clone)]
pub struct PilotContext {
    pub config: Arc<PilotConfig>,
    pub patterns: Arc<PatternSet>,
    pub queue: TaskQueue,
    pub events: EventBroadcaster,
}

impl PilotContext {
    /// Build a context. The pattern table comes from `detection.patterns_file`
    /// when set, otherwise the built-in one is used.
    pub fn new(
        config: PilotConfig,
        history: Option<Arc<dyn TaskHistory>>,
    ) -> PilotResult<Self> {
        config.validate()?;

        let patterns = match config.detection.patterns_file {
            Some(ref path) => {
                let set = PatternSet::load(path).map_err(|e| {
                    PilotError::Config(ConfigError::Invalid {
                        field: "detection.patterns_file",
                        reason: e.to_string(),
                    })
                })?;
                Arc::new(set)
            }
            None => PatternSet::builtin(),
        };

        let events = EventBroadcaster::new();
        let queue = match history {
            Some(history) => TaskQueue::with_history(events.clone(), history),
            None => TaskQueue::new(events.clone()),
        };

        Ok(Self {
            config: Arc::new(config),
            patterns,
            queue,
            events,
        })
    }
}

/// Commands accepted from a control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PilotCommand {
    StartSession {
        #[serde(default)]
        permission_mode: PermissionMode,
    },
    StopSession,
    ResetSession {
        #[serde(default)]
        keep_processing: bool,
    },
    StartQueue {
        #[serde(default)]
        permission_mode: PermissionMode,
    },
    StopQueue,
    ResumeQueue,
    Enqueue {
        text: String,
    },
    ForwardKeypress {
        key: KeyInput,
    },
}

pub struct Pilot {
    context: PilotContext,
    supervisor: SessionSupervisor,
    orchestrator: QueueOrchestrator,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl Pilot {
    /// Pilot driving a real terminal session. Must be called inside a runtime.
    pub fn new(context: PilotContext) -> Self {
        Self::with_process(context, Arc::new(PtySpawner), Arc::new(CliPathResolver))
    }

    pub fn with_process(
        context: PilotContext,
        spawner: Arc<dyn ProcessSpawner>,
        resolver: Arc<dyn CommandResolver>,
    ) -> Self {
        let config = context.config.clone();
        let supervisor = SessionSupervisor::new(
            config.session.clone(),
            Duration::from_millis(config.health.interval_ms),
            context.queue.clone(),
            context.events.clone(),
            spawner,
            resolver,
        );
        let orchestrator = QueueOrchestrator::new(
            &config,
            context.patterns.clone(),
            context.queue.clone(),
            supervisor.clone(),
        );

        let forwarders = [OutputSink::Log, OutputSink::Live]
            .into_iter()
            .map(|sink| {
                spawn_forwarder(
                    supervisor.subscribe_output(),
                    sink,
                    &config.output,
                    context.events.clone(),
                )
            })
            .collect();

        Self {
            context,
            supervisor,
            orchestrator,
            forwarders: Mutex::new(forwarders),
        }
    }

    pub fn context(&self) -> &PilotContext {
        &self.context
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn orchestrator(&self) -> &QueueOrchestrator {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PilotEvent> {
        self.context.events.subscribe()
    }

    pub fn restore(&self, history: &dyn TaskHistory) -> anyhow::Result<usize> {
        self.orchestrator.restore(history)
    }

    /// Run one command. Only spawn and dependency failures of an explicit
    /// session start are returned; other failures are logged or end up on
    /// the affected task. `Enqueue` yields the created task.
    pub async fn execute(&self, command: PilotCommand) -> PilotResult<Option<Task>> {
        log::debug!("[Pilot] Executing {:?}", command);
        match command {
            PilotCommand::StartSession { permission_mode } => {
                match self.supervisor.ensure_ready(permission_mode).await {
                    Err(e) if e.is_foreground() => return Err(e),
                    Err(e) => log::warn!("[Pilot] Session start incomplete: {}", e),
                    Ok(()) => {}
                }
            }
            PilotCommand::StopSession => {
                self.supervisor.stop();
            }
            PilotCommand::ResetSession { keep_processing } => {
                self.supervisor.reset(keep_processing);
            }
            PilotCommand::StartQueue { permission_mode } => {
                self.orchestrator.start(permission_mode);
            }
            PilotCommand::StopQueue => self.orchestrator.stop(),
            PilotCommand::ResumeQueue => {
                if !self.orchestrator.resume() {
                    log::debug!("[Pilot] Resume ignored, queue is not paused");
                }
            }
            PilotCommand::Enqueue { text } => return Ok(self.orchestrator.enqueue(&text)),
            PilotCommand::ForwardKeypress { key } => {
                if let Err(e) = self.supervisor.send_key(key).await {
                    log::warn!("[Pilot] Could not forward {:?}: {}", key, e);
                }
            }
        }
        Ok(None)
    }

    /// Stop the queue and the session and end output forwarding
    pub fn shutdown(&self) -> ShutdownReport {
        self.orchestrator.stop();
        let interrupted_task = self.context.queue.processing().map(|t| t.id);
        let session_stopped = self.supervisor.stop();
        for forwarder in lock_mutex_recover(&self.forwarders).drain(..) {
            forwarder.abort();
        }
        log::info!(
            "[Pilot] Shut down (session stopped: {}, interrupted task: {:?})",
            session_stopped,
            interrupted_task
        );
        ShutdownReport {
            session_stopped,
            interrupted_task,
        }
    }
}

impl Drop for Pilot {
    fn drop(&mut self) {
        for forwarder in lock_mutex_recover(&self.forwarders).drain(..) {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EVENT_OUTPUT_LIVE, EVENT_OUTPUT_LOG};
    use crate::session::scripted::{FixedResolver, ScriptedSpawner};

    fn pilot_with(spawner: ScriptedSpawner, resolver: FixedResolver) -> (Pilot, Arc<ScriptedSpawner>) {
        let mut config = PilotConfig::default();
        config.session.settle_delay_ms = 100;
        let context = PilotContext::new(config, None).unwrap();
        let spawner = Arc::new(spawner);
        let pilot = Pilot::with_process(context, spawner.clone(), Arc::new(resolver));
        (pilot, spawner)
    }

    #[test]
    fn test_command_wire_format() {
        let cmd: PilotCommand =
            serde_json::from_str(r#"{"command":"forward_keypress","key":"down"}"#).unwrap();
        assert_eq!(cmd, PilotCommand::ForwardKeypress { key: KeyInput::Down });

        let cmd: PilotCommand = serde_json::from_str(r#"{"command":"start_queue"}"#).unwrap();
        assert_eq!(
            cmd,
            PilotCommand::StartQueue {
                permission_mode: PermissionMode::Default
            }
        );
    }

    #[test]
    fn test_invalid_patterns_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("patterns.yaml");
        std::fs::write(
            &path,
            r#"
version: 1
completion_phrases: ["done"]
error_patterns: ["("]
retry_after_pattern: 'retry after (\d+)'
reset_hint_pattern: 'resets at (.+)'
"#,
        )
        .unwrap();

        let mut config = PilotConfig::default();
        config.detection.patterns_file = Some(path);
        assert!(matches!(
            PilotContext::new(config, None),
            Err(PilotError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_surfaces_dependency_error() {
        let (pilot, _) = pilot_with(ScriptedSpawner::new(), FixedResolver::missing());
        let err = pilot
            .execute(PilotCommand::StartSession {
                permission_mode: PermissionMode::Default,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::Dependency { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_and_forward_keys() {
        let (pilot, spawner) = pilot_with(
            ScriptedSpawner::new().with_greeting("ready\r\n"),
            FixedResolver::found("/bin/agent"),
        );
        pilot
            .execute(PilotCommand::StartSession {
                permission_mode: PermissionMode::SkipPermissions,
            })
            .await
            .unwrap();
        assert!(pilot.supervisor().is_ready());

        pilot
            .execute(PilotCommand::ForwardKeypress { key: KeyInput::Escape })
            .await
            .unwrap();
        let ctl = spawner.last().unwrap();
        assert_eq!(ctl.written(), b"\x1b".to_vec());
        assert_eq!(ctl.request().args, vec!["--skip-permissions".to_string()]);

        let report = pilot.shutdown();
        assert!(report.session_stopped);
        assert!(report.interrupted_task.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_returns_task() {
        let (pilot, _) = pilot_with(ScriptedSpawner::new(), FixedResolver::found("/bin/agent"));
        let task = pilot
            .execute(PilotCommand::Enqueue {
                text: "write the docs".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.text, "write the docs");
        assert!(pilot
            .execute(PilotCommand::Enqueue { text: "  ".to_string() })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_reaches_both_sinks() {
        let (pilot, spawner) = pilot_with(
            ScriptedSpawner::new().with_greeting("hello from the agent\r\n"),
            FixedResolver::found("/bin/agent"),
        );
        let mut events = pilot.subscribe();
        pilot
            .execute(PilotCommand::StartSession {
                permission_mode: PermissionMode::Default,
            })
            .await
            .unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut sinks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.event == EVENT_OUTPUT_LOG || event.event == EVENT_OUTPUT_LIVE {
                sinks.push(event.event.clone());
            }
        }
        assert!(sinks.contains(&EVENT_OUTPUT_LOG.to_string()));
        assert!(sinks.contains(&EVENT_OUTPUT_LIVE.to_string()));
    }
}
