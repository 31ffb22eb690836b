// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state across the application
#[derive(Clone)]
pub struct ShutdownState {
    /// Flag indicating shutdown has been requested
    shutdown_requested: Arc<AtomicBool>,
    /// Flag indicating cleanup has completed
    cleanup_complete: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("Cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// What a shutdown left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub session_stopped: bool,
    /// Task that was processing when the session was stopped; it is
    /// restored as interrupted on the next run
    pub interrupted_task: Option<String>,
}

/// Register signal handlers for Unix systems
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("Received SIGTERM"),
                SIGHUP => log::info!("Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}
