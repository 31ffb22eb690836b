//! Interactive agent session: spawning, supervision, and input

pub mod path_resolver;
pub mod process;
pub mod pty;
pub mod scripted;
pub mod supervisor;

pub use path_resolver::{CliPathResolver, CommandResolver};
pub use process::{ProcessHandle, ProcessSpawner, SpawnRequest, SpawnedProcess};
pub use pty::PtySpawner;
pub use supervisor::{SessionEvent, SessionSupervisor};
