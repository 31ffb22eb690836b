// Output classification: raw PTY bytes to clean text, rolling window,
// and throttled forwarding to display consumers

pub mod ansi;
pub mod classifier;
pub mod throttle;
pub mod window;

pub use classifier::{Classified, OutputClassifier};
pub use throttle::{Deduplicator, FlushMode, OutputThrottle};
pub use window::OutputWindow;

use crate::config::OutputConfig;
use crate::events::{EventBroadcaster, OutputPayload, EVENT_OUTPUT_LIVE, EVENT_OUTPUT_LOG};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One classified chunk as published by the session output pump
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub text: String,
    pub screen_cleared: bool,
    /// Number of raw bytes the chunk was built from
    pub raw_len: usize,
    pub received_at: Instant,
}

impl OutputChunk {
    pub fn new(classified: Classified, raw_len: usize) -> Self {
        Self {
            text: classified.text,
            screen_cleared: classified.screen_cleared,
            raw_len,
            received_at: Instant::now(),
        }
    }
}

/// Which display consumer a forwarder feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSink {
    /// Append-only log of new text
    Log,
    /// Snapshot of the current screen
    Live,
}

impl OutputSink {
    fn event_name(&self) -> &'static str {
        match self {
            OutputSink::Log => EVENT_OUTPUT_LOG,
            OutputSink::Live => EVENT_OUTPUT_LIVE,
        }
    }

    fn flush_mode(&self) -> FlushMode {
        match self {
            OutputSink::Log => FlushMode::Delta,
            OutputSink::Live => FlushMode::Screen,
        }
    }
}

pub fn throttle_for(sink: OutputSink, config: &OutputConfig) -> OutputThrottle {
    OutputThrottle::new(
        sink.flush_mode(),
        Duration::from_millis(config.throttle_interval_ms),
        Duration::from_millis(config.auto_clear_ms),
        Duration::from_millis(config.dedup_interval_ms),
    )
}

/// Spawn a task that throttles one output stream into events for `sink`.
/// Ends when the output channel closes.
pub fn spawn_forwarder(
    mut rx: broadcast::Receiver<OutputChunk>,
    sink: OutputSink,
    config: &OutputConfig,
    events: EventBroadcaster,
) -> JoinHandle<()> {
    let mut throttle = throttle_for(sink, config);

    tokio::spawn(async move {
        let emit = |text: String| {
            events.broadcast(
                sink.event_name(),
                OutputPayload {
                    text,
                    timestamp: chrono::Utc::now(),
                },
            );
        };

        let mut ticker = tokio::time::interval(throttle.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Ok(chunk) => {
                        if let Some(block) = throttle.push(&chunk.text, chunk.screen_cleared, Instant::now()) {
                            emit(block);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("[OutputForwarder] {:?} sink lagged, skipped {} chunks", sink, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(block) = throttle.flush_now(Instant::now()) {
                            emit(block);
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Some(block) = throttle.poll(Instant::now()) {
                        emit(block);
                    }
                }
            }
        }

        log::debug!("[OutputForwarder] {:?} forwarder stopped", sink);
    })
}
