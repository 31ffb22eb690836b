//! Throttling and de-duplication of output sent to display consumers
//!
//! Both types are driven with explicit `now` values so the timing rules can
//! be tested without a runtime.

use std::time::Duration;
use tokio::time::Instant;

/// Keep at most this much of the current screen for live snapshots
const MAX_SCREEN_CHARS: usize = 16 * 1024;

/// What a consumer receives on each flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only text that arrived since the previous flush
    Delta,
    /// Everything since the last screen clear
    Screen,
}

/// Suppresses identical blocks sent again within a minimum interval
#[derive(Debug)]
pub struct Deduplicator {
    min_interval: Duration,
    last_hash: Option<blake3::Hash>,
    last_sent_at: Option<Instant>,
}

impl Deduplicator {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_hash: None,
            last_sent_at: None,
        }
    }

    /// Returns true if the block should be sent, recording it as sent
    pub fn should_send(&mut self, block: &str, now: Instant) -> bool {
        let hash = blake3::hash(block.as_bytes());
        if self.last_hash == Some(hash) {
            if let Some(sent_at) = self.last_sent_at {
                if now.saturating_duration_since(sent_at) < self.min_interval {
                    return false;
                }
            }
        }
        self.last_hash = Some(hash);
        self.last_sent_at = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.last_hash = None;
        self.last_sent_at = None;
    }
}

/// Buffers clean text and releases it at most once per interval, with a
/// trailing flush once the interval has elapsed even if no new data comes.
#[derive(Debug)]
pub struct OutputThrottle {
    mode: FlushMode,
    interval: Duration,
    auto_clear: Duration,
    pending: String,
    screen: String,
    dirty: bool,
    last_flush: Option<Instant>,
    last_data: Option<Instant>,
    dedup: Deduplicator,
}

impl OutputThrottle {
    pub fn new(
        mode: FlushMode,
        interval: Duration,
        auto_clear: Duration,
        dedup_interval: Duration,
    ) -> Self {
        Self {
            mode,
            interval,
            auto_clear,
            pending: String::new(),
            screen: String::new(),
            dirty: false,
            last_flush: None,
            last_data: None,
            dedup: Deduplicator::new(dedup_interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add text; returns a block if the interval allows flushing right away
    pub fn push(&mut self, text: &str, screen_cleared: bool, now: Instant) -> Option<String> {
        if screen_cleared {
            self.screen.clear();
            if self.mode == FlushMode::Screen {
                self.pending.clear();
            }
        }

        self.screen.push_str(text);
        if self.screen.len() > MAX_SCREEN_CHARS {
            let mut cut = self.screen.len() - MAX_SCREEN_CHARS;
            while !self.screen.is_char_boundary(cut) {
                cut += 1;
            }
            self.screen.drain(..cut);
        }
        self.pending.push_str(text);
        self.dirty = self.dirty || !text.is_empty() || screen_cleared;
        self.last_data = Some(now);

        if self.interval_elapsed(now) {
            self.flush(now)
        } else {
            None
        }
    }

    /// Timer tick: trailing flush and idle auto-clear
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if self.dirty {
            if self.interval_elapsed(now) {
                return self.flush(now);
            }
            return None;
        }

        if let Some(last_data) = self.last_data {
            if now.saturating_duration_since(last_data) >= self.auto_clear
                && !self.screen.is_empty()
            {
                log::trace!("[OutputThrottle] Auto-clearing idle screen buffer");
                self.screen.clear();
                self.dedup.reset();
            }
        }
        None
    }

    /// Flush whatever is pending regardless of the interval
    pub fn flush_now(&mut self, now: Instant) -> Option<String> {
        if self.dirty {
            self.flush(now)
        } else {
            None
        }
    }

    pub fn screen(&self) -> &str {
        &self.screen
    }

    fn interval_elapsed(&self, now: Instant) -> bool {
        match self.last_flush {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    fn flush(&mut self, now: Instant) -> Option<String> {
        let block = match self.mode {
            FlushMode::Delta => std::mem::take(&mut self.pending),
            FlushMode::Screen => {
                self.pending.clear();
                self.screen.clone()
            }
        };
        self.dirty = false;
        self.last_flush = Some(now);

        if block.trim().is_empty() {
            return None;
        }
        if !self.dedup.should_send(&block, now) {
            return None;
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(mode: FlushMode) -> OutputThrottle {
        OutputThrottle::new(
            mode,
            Duration::from_millis(500),
            Duration::from_secs(10),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn test_first_push_flushes_immediately() {
        let start = Instant::now();
        let mut t = throttle(FlushMode::Delta);
        assert_eq!(t.push("hello", false, start), Some("hello".to_string()));
    }

    #[test]
    fn test_flush_at_most_once_per_interval_with_trailing_flush() {
        let start = Instant::now();
        let mut t = throttle(FlushMode::Delta);
        t.push("a", false, start);

        assert_eq!(t.push("b", false, start + Duration::from_millis(100)), None);
        assert_eq!(t.push("c", false, start + Duration::from_millis(200)), None);
        assert_eq!(t.poll(start + Duration::from_millis(300)), None);

        // Trailing flush without any new data
        assert_eq!(
            t.poll(start + Duration::from_millis(500)),
            Some("bc".to_string())
        );
        assert_eq!(t.poll(start + Duration::from_millis(1200)), None);
    }

    #[test]
    fn test_screen_mode_resets_on_clear() {
        let start = Instant::now();
        let mut t = throttle(FlushMode::Screen);
        t.push("old screen\n", false, start);
        let block = t.push("new screen\n", true, start + Duration::from_millis(600));
        assert_eq!(block, Some("new screen\n".to_string()));
    }

    #[test]
    fn test_identical_rerender_is_suppressed() {
        let start = Instant::now();
        let mut t = throttle(FlushMode::Screen);
        assert!(t.push("frame", true, start).is_some());
        assert_eq!(t.push("frame", true, start + Duration::from_millis(600)), None);
        // Past the dedup interval the same block goes out again
        assert!(t
            .push("frame", true, start + Duration::from_millis(3700))
            .is_some());
    }

    #[test]
    fn test_auto_clear_after_idle() {
        let start = Instant::now();
        let mut t = throttle(FlushMode::Screen);
        t.push("some text", false, start);
        assert_eq!(t.screen(), "some text");

        t.poll(start + Duration::from_secs(11));
        assert_eq!(t.screen(), "");
    }

    #[test]
    fn test_deduplicator() {
        let start = Instant::now();
        let mut dedup = Deduplicator::new(Duration::from_secs(1));
        assert!(dedup.should_send("x", start));
        assert!(!dedup.should_send("x", start + Duration::from_millis(500)));
        assert!(dedup.should_send("y", start + Duration::from_millis(600)));
        assert!(dedup.should_send("x", start + Duration::from_millis(700)));
    }
}
