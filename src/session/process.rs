//! Process spawning seam between the supervisor and the OS

use crate::errors::PilotError;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Everything needed to launch the agent subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Control over a running subprocess
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// `Ok(Some(code))` once the process has exited
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly spawned subprocess. `output` yields raw terminal bytes and
/// closes when the process side of the terminal is gone.
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub input: Box<dyn Write + Send>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PilotError>;
}
