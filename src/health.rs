// Periodic liveness probing of the active session

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What the monitor needs from the session it watches
pub trait LivenessProbe: Send + Sync {
    /// Whether the session currently claims to be ready
    fn claims_ready(&self) -> bool;

    /// Check the process; `Err` carries the reason it is not alive
    fn probe(&self) -> Result<(), String>;

    /// Tear the session down after a failed probe
    fn mark_unhealthy(&self, reason: String);
}

/// Probes one session on a fixed interval. Never respawns anything.
pub struct HealthMonitor {
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn start(probe: Arc<dyn LivenessProbe>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !probe.claims_ready() {
                    continue;
                }
                if let Err(reason) = probe.probe() {
                    log::warn!("[HealthMonitor] Liveness probe failed: {}", reason);
                    probe.mark_unhealthy(reason);
                    break;
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Let the task run to completion on its own
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProbe {
        ready: AtomicBool,
        alive: AtomicBool,
        probes: AtomicUsize,
        unhealthy: Mutex<Option<String>>,
    }

    impl LivenessProbe for FakeProbe {
        fn claims_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn probe(&self) -> Result<(), String> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("process exited".to_string())
            }
        }

        fn mark_unhealthy(&self, reason: String) {
            *self.unhealthy.lock().unwrap() = Some(reason);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_session_is_not_probed() {
        let probe = Arc::new(FakeProbe::default());
        let monitor = HealthMonitor::start(probe.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_marks_unhealthy_once() {
        let probe = Arc::new(FakeProbe::default());
        probe.ready.store(true, Ordering::SeqCst);
        probe.alive.store(true, Ordering::SeqCst);
        let monitor = HealthMonitor::start(probe.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 2);
        assert!(probe.unhealthy.lock().unwrap().is_none());

        probe.alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(
            probe.unhealthy.lock().unwrap().as_deref(),
            Some("process exited")
        );

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_probing() {
        let probe = Arc::new(FakeProbe::default());
        probe.ready.store(true, Ordering::SeqCst);
        probe.alive.store(true, Ordering::SeqCst);
        let mut monitor = HealthMonitor::start(probe.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
    }
}
