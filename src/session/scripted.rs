//! In-memory stand-in for the agent process
//!
//! Drives the supervisor and queue without a real terminal: output is
//! pushed through a [`ScriptedController`], keystrokes written by the
//! supervisor are recorded, and an optional responder reacts to them.

use super::path_resolver::CommandResolver;
use super::process::{ProcessHandle, ProcessSpawner, SpawnRequest, SpawnedProcess};
use crate::errors::PilotError;
use crate::utils::lock_mutex_recover;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Called with every write the supervisor makes to the process
pub type Responder = Arc<dyn Fn(&ScriptedController, &[u8]) + Send + Sync>;

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

struct ControllerInner {
    pid: u32,
    request: SpawnRequest,
    output: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    exit_code: Mutex<Option<i32>>,
    written: Mutex<Vec<u8>>,
    input_closed: AtomicBool,
    killed: AtomicBool,
}

/// Test-side view of one scripted process
#[derive(Clone)]
pub struct ScriptedController {
    inner: Arc<ControllerInner>,
}

impl ScriptedController {
    fn new(request: SpawnRequest, output: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
                request,
                output: Mutex::new(Some(output)),
                exit_code: Mutex::new(None),
                written: Mutex::new(Vec::new()),
                input_closed: AtomicBool::new(false),
                killed: AtomicBool::new(false),
            }),
        }
    }

    /// Write bytes to the terminal as if the process printed them
    pub fn emit(&self, data: impl AsRef<[u8]>) {
        if let Some(tx) = lock_mutex_recover(&self.inner.output).as_ref() {
            let _ = tx.send(data.as_ref().to_vec());
        }
    }

    /// Exit with `code` and close the terminal
    pub fn exit(&self, code: i32) {
        lock_mutex_recover(&self.inner.exit_code).get_or_insert(code);
        lock_mutex_recover(&self.inner.output).take();
    }

    /// Make every later write fail while the process keeps running
    pub fn close_input(&self) {
        self.inner.input_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        lock_mutex_recover(&self.inner.exit_code).is_none()
    }

    pub fn was_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    pub fn request(&self) -> &SpawnRequest {
        &self.inner.request
    }

    pub fn written(&self) -> Vec<u8> {
        lock_mutex_recover(&self.inner.written).clone()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }
}

struct ScriptedHandle {
    controller: ScriptedController,
}

impl ProcessHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.controller.inner.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(*lock_mutex_recover(&self.controller.inner.exit_code))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.controller.inner.killed.store(true, Ordering::SeqCst);
        self.controller.exit(-9);
        Ok(())
    }
}

struct ScriptedWriter {
    controller: ScriptedController,
    responder: Option<Responder>,
}

impl Write for ScriptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.controller.inner.input_closed.load(Ordering::SeqCst)
            || !self.controller.is_alive()
        {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "input closed"));
        }
        lock_mutex_recover(&self.controller.inner.written).extend_from_slice(buf);
        if let Some(ref responder) = self.responder {
            responder(&self.controller, buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Spawner that hands out scripted processes
#[derive(Default)]
pub struct ScriptedSpawner {
    greeting: Option<Vec<u8>>,
    responder: Option<Responder>,
    controllers: Mutex<Vec<ScriptedController>>,
    fail_next: Mutex<Option<String>>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output emitted as soon as a process starts
    pub fn with_greeting(mut self, greeting: impl AsRef<[u8]>) -> Self {
        self.greeting = Some(greeting.as_ref().to_vec());
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&ScriptedController, &[u8]) + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Make the next spawn attempt fail with `reason`
    pub fn fail_next_spawn(&self, reason: &str) {
        *lock_mutex_recover(&self.fail_next) = Some(reason.to_string());
    }

    pub fn spawn_count(&self) -> usize {
        lock_mutex_recover(&self.controllers).len()
    }

    pub fn controller(&self, index: usize) -> Option<ScriptedController> {
        lock_mutex_recover(&self.controllers).get(index).cloned()
    }

    pub fn last(&self) -> Option<ScriptedController> {
        lock_mutex_recover(&self.controllers).last().cloned()
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PilotError> {
        if let Some(reason) = lock_mutex_recover(&self.fail_next).take() {
            return Err(PilotError::Spawn {
                program: request.program.display().to_string(),
                reason,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = ScriptedController::new(request.clone(), tx);
        if let Some(ref greeting) = self.greeting {
            controller.emit(greeting);
        }
        lock_mutex_recover(&self.controllers).push(controller.clone());

        Ok(SpawnedProcess {
            handle: Box::new(ScriptedHandle {
                controller: controller.clone(),
            }),
            input: Box::new(ScriptedWriter {
                controller,
                responder: self.responder.clone(),
            }),
            output: rx,
        })
    }
}

/// Resolver that answers every lookup with the same path, or with none
pub struct FixedResolver(pub Option<PathBuf>);

impl FixedResolver {
    pub fn found(path: impl Into<PathBuf>) -> Self {
        Self(Some(path.into()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl CommandResolver for FixedResolver {
    fn resolve(&self, _command: &str) -> Option<PathBuf> {
        self.0.clone()
    }
}
