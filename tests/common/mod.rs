// Shared harness for integration tests: a pilot wired to a scripted agent
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tui_queue_lib::history::TaskHistory;
use tui_queue_lib::session::scripted::{FixedResolver, ScriptedController, ScriptedSpawner};
use tui_queue_lib::{Pilot, PilotConfig, PilotContext, Task, TaskStatus};

pub const GREETING: &str = "> Type a message\r\n";

/// Defaults with short settle and cooldown delays
pub fn fast_config() -> PilotConfig {
    let mut config = PilotConfig::default();
    config.detection.min_task_duration_ms = 0;
    config.session.settle_delay_ms = 100;
    config.queue.cooldown_ms = 100;
    config
}

pub fn pilot(config: PilotConfig, spawner: ScriptedSpawner) -> (Pilot, Arc<ScriptedSpawner>) {
    pilot_with_history(config, spawner, None)
}

pub fn pilot_with_history(
    config: PilotConfig,
    spawner: ScriptedSpawner,
    history: Option<Arc<dyn TaskHistory>>,
) -> (Pilot, Arc<ScriptedSpawner>) {
    let context = PilotContext::new(config, history).expect("valid config");
    let spawner = Arc::new(spawner);
    let pilot = Pilot::with_process(
        context,
        spawner.clone(),
        Arc::new(FixedResolver::found("/usr/local/bin/agent")),
    );
    (pilot, spawner)
}

/// Agent that runs `respond` each time a payload is confirmed with Enter
pub fn on_confirm<F>(respond: F) -> ScriptedSpawner
where
    F: Fn(&ScriptedController) + Send + Sync + 'static,
{
    ScriptedSpawner::new()
        .with_greeting(GREETING)
        .with_responder(move |ctl, input| {
            if input == b"\r" {
                respond(ctl);
            }
        })
}

/// Emit `text` from the agent after `delay`
pub fn emit_later(ctl: &ScriptedController, delay: Duration, text: &'static str) {
    let ctl = ctl.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        ctl.emit(text);
    });
}

/// Records when the agent received each confirm keystroke
#[derive(Clone, Default)]
pub struct ConfirmClock(Arc<Mutex<Vec<Instant>>>);

impl ConfirmClock {
    pub fn record(&self) {
        self.0.lock().unwrap().push(Instant::now());
    }

    pub fn first(&self) -> Option<Instant> {
        self.0.lock().unwrap().first().copied()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub fn task(pilot: &Pilot, id: &str) -> Task {
    pilot
        .orchestrator()
        .snapshot()
        .into_iter()
        .find(|t| t.id == id)
        .expect("task is in the queue")
}

/// Poll every 10ms until `cond` holds; returns when it first held
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> Option<Instant>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return Some(Instant::now());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

pub async fn wait_for_status(
    pilot: &Pilot,
    id: &str,
    status: TaskStatus,
    limit: Duration,
) -> Option<Instant> {
    wait_until(limit, || task(pilot, id).status == status).await
}
