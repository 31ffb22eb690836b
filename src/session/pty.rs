//! PTY-backed process spawner
//!
//! The agent renders a full-screen interface, so it runs inside a pseudo
//! terminal with a fixed geometry. The blocking PTY reader lives on the
//! blocking pool and forwards raw chunks over a channel.

use super::process::{ProcessHandle, ProcessSpawner, SpawnRequest, SpawnedProcess};
use crate::errors::PilotError;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::Read;
use tokio::sync::mpsc;

/// Bytes requested per PTY read
const READ_CHUNK_SIZE: usize = 4096;

pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PilotError> {
        let program = request.program.display().to_string();
        let spawn_error = |stage: &str, e: &dyn std::fmt::Display| PilotError::Spawn {
            program: program.clone(),
            reason: format!("{}: {}", stage, e),
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error("Failed to open PTY", &e))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        if let Some(ref cwd) = request.working_dir {
            cmd.cwd(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_error("Failed to spawn", &e))?;

        // Drop the slave so the reader sees EOF once the child exits
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error("Failed to clone PTY reader", &e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error("Failed to get PTY writer", &e))?;

        let pid = child.process_id();
        log::info!(
            "[PtySpawner] Spawned {} {:?} (pid {:?}, {}x{})",
            program,
            request.args,
            pid,
            request.cols,
            request.rows
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        log::debug!("[PtySpawner] PTY EOF for pid {:?}", pid);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a closed slave side
                        log::debug!("[PtySpawner] PTY read ended for pid {:?}: {}", pid, e);
                        break;
                    }
                }
            }
        });

        Ok(SpawnedProcess {
            handle: Box::new(PtyProcess {
                child,
                _master: pair.master,
            }),
            input: writer,
            output: rx,
        })
    }
}

struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    // Closing the master hangs up the child, so it lives as long as the handle
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
    }
}
