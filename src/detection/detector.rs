//! Stateful completion detector for one task

use super::signals::{observe, Observations};
use super::verdict::{evaluate, DetectionState, Thresholds, Verdict};
use crate::config::DetectionConfig;
use crate::output::{OutputChunk, OutputWindow};
use crate::patterns::PatternSet;
use std::sync::Arc;
use tokio::time::Instant;

/// Feeds output into a private window and turns each poll into a verdict.
/// Created when a task is dispatched and dropped once it resolves.
pub struct CompletionDetector {
    patterns: Arc<PatternSet>,
    thresholds: Thresholds,
    tail_lines: usize,
    task_text: String,
    window: OutputWindow,
    state: DetectionState,
    last_verdict: Verdict,
}

impl CompletionDetector {
    pub fn new(
        task_text: &str,
        patterns: Arc<PatternSet>,
        config: &DetectionConfig,
        started_at: Instant,
    ) -> Self {
        Self {
            patterns,
            thresholds: Thresholds::from(config),
            tail_lines: config.tail_lines,
            task_text: task_text.to_string(),
            window: OutputWindow::new(config.window_lines),
            state: DetectionState::new(started_at, task_text.chars().count()),
            last_verdict: Verdict::AwaitingWork,
        }
    }

    pub fn ingest(&mut self, chunk: &OutputChunk) {
        self.window.apply(&chunk.text, chunk.screen_cleared);
        if chunk.raw_len > 0 {
            self.state.last_data_at = self.state.last_data_at.max(chunk.received_at);
        }
    }

    /// Re-evaluate the window. Timers are updated before the verdict.
    pub fn poll(&mut self, now: Instant) -> Verdict {
        let lines = self.window.lines();
        let obs = observe(&lines, &self.patterns, &self.task_text, self.tail_lines);
        self.apply(&obs, now);

        let verdict = evaluate(&obs, &self.state, now, &self.thresholds);
        if verdict.phase() != self.last_verdict.phase() {
            log::debug!(
                "[CompletionDetector] {:?} -> {:?}",
                self.last_verdict.phase(),
                verdict.phase()
            );
        }
        self.last_verdict = verdict.clone();
        verdict
    }

    fn apply(&mut self, obs: &Observations, now: Instant) {
        let state = &mut self.state;
        let len = self.window.text_len();
        let progress = self.window.progress_len();

        if progress.abs_diff(state.last_significant_len) > self.thresholds.change_tolerance {
            state.last_significant_len = progress;
            state.last_meaningful_change_at = state.last_data_at;
        }

        if obs.real_work && !state.has_confirmed_real_work {
            log::debug!("[CompletionDetector] Real work confirmed");
            state.has_confirmed_real_work = true;
            state.has_started_work = true;
        }
        if !state.has_started_work
            && len > state.baseline_growth + self.thresholds.growth_threshold
        {
            log::debug!("[CompletionDetector] Work started (output grew to {} chars)", len);
            state.has_started_work = true;
        }

        if obs.active {
            state.prompt_detected_at = None;
            state.completion_phrase_detected_at = None;
            return;
        }
        state.prompt_detected_at = if obs.prompt {
            Some(state.prompt_detected_at.unwrap_or(now))
        } else {
            None
        };
        state.completion_phrase_detected_at = if obs.completion_phrase.is_some() {
            Some(state.completion_phrase_detected_at.unwrap_or(now))
        } else {
            None
        };
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    pub fn last_verdict(&self) -> &Verdict {
        &self.last_verdict
    }

    /// Output captured for the task record
    pub fn captured_output(&self) -> String {
        self.window.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Signal;
    use crate::output::{Classified, OutputClassifier};
    use std::time::Duration;

    fn chunk(text: &str, at: Instant) -> OutputChunk {
        let mut chunk = OutputChunk::new(
            Classified {
                text: text.to_string(),
                screen_cleared: false,
            },
            text.len(),
        );
        chunk.received_at = at;
        chunk
    }

    fn detector(start: Instant, config: &DetectionConfig) -> CompletionDetector {
        CompletionDetector::new("create a file", PatternSet::builtin(), config, start)
    }

    #[test]
    fn test_small_growth_is_noise() {
        let start = Instant::now();
        let mut det = detector(start, &DetectionConfig::default());
        det.ingest(&chunk("> create a file\n", start));
        det.ingest(&chunk("status bar 42%\n", start));
        assert_eq!(det.poll(start), Verdict::AwaitingWork);
        assert!(!det.state().has_started_work);
    }

    #[test]
    fn test_large_growth_starts_work_without_confirming() {
        let start = Instant::now();
        let mut det = detector(start, &DetectionConfig::default());
        det.ingest(&chunk(&"x".repeat(300), start));
        det.poll(start);
        assert!(det.state().has_started_work);
        assert!(!det.state().has_confirmed_real_work);
    }

    #[test]
    fn test_active_marker_resets_phrase_timer() {
        let start = Instant::now();
        let config = DetectionConfig {
            min_task_duration_ms: 0,
            ..Default::default()
        };
        let mut det = detector(start, &config);
        det.ingest(&chunk("I will create the file.\nFile created\n", start));
        det.poll(start);
        assert_eq!(det.state().completion_phrase_detected_at, Some(start));

        let later = start + Duration::from_millis(1000);
        det.ingest(&chunk("⠋ Working... (esc to interrupt)", later));
        assert_eq!(det.poll(later), Verdict::Working);
        assert_eq!(det.state().completion_phrase_detected_at, None);
    }

    #[test]
    fn test_phrase_resolves_after_grace() {
        let start = Instant::now();
        let config = DetectionConfig {
            min_task_duration_ms: 0,
            ..Default::default()
        };
        let mut det = detector(start, &config);
        det.ingest(&chunk("I will create the file.\n", start));
        det.poll(start);

        let t1 = start + Duration::from_millis(1000);
        det.ingest(&chunk("Done. File created at ./out.txt\n", t1));
        assert!(matches!(det.poll(t1), Verdict::Pending { .. }));
        assert!(!det.poll(t1 + Duration::from_millis(1999)).is_final());
        assert_eq!(
            det.poll(t1 + Duration::from_millis(2000)),
            Verdict::Success(Signal::CompletionPhrase)
        );
        assert!(det.captured_output().contains("File created"));
    }

    #[test]
    fn test_clear_screen_discards_phrase() {
        let start = Instant::now();
        let config = DetectionConfig {
            min_task_duration_ms: 0,
            ..Default::default()
        };
        let mut det = detector(start, &config);
        det.ingest(&chunk("I will create the file.\nFile created\n", start));
        det.poll(start);
        assert!(det.state().completion_phrase_detected_at.is_some());

        let cleared = OutputChunk::new(
            Classified {
                text: "fresh screen\n".to_string(),
                screen_cleared: true,
            },
            20,
        );
        det.ingest(&cleared);
        det.poll(start + Duration::from_millis(500));
        assert!(det.state().completion_phrase_detected_at.is_none());
        assert!(!det.captured_output().contains("File created"));
    }

    #[test]
    fn test_steady_progress_in_full_window_is_change() {
        let start = Instant::now();
        let config = DetectionConfig {
            min_task_duration_ms: 0,
            window_lines: 5,
            ..Default::default()
        };
        let mut det = detector(start, &config);
        for n in 1..=5 {
            det.ingest(&chunk(&format!("compiling module {:02} of 40\n", n), start));
        }
        det.poll(start);

        for n in 6..=20u64 {
            let at = start + Duration::from_secs(n);
            det.ingest(&chunk(&format!("compiling module {:02} of 40\n", n), at));
            det.poll(at);
            assert_eq!(det.state().last_meaningful_change_at, at);
        }
    }

    #[test]
    fn test_cursor_addressed_redraws_resolve() {
        let start = Instant::now();
        let config = DetectionConfig {
            min_task_duration_ms: 0,
            ..Default::default()
        };
        let mut det = detector(start, &config);
        let mut classifier = OutputClassifier::new();
        let mut feed = |det: &mut CompletionDetector, raw: &[u8], at: Instant| {
            let mut chunk = OutputChunk::new(classifier.normalize(raw), raw.len());
            chunk.received_at = at;
            det.ingest(&chunk);
        };

        feed(
            &mut det,
            "\x1b[1;1HI will run the checks.\x1b[2;1H⠋ Working... (esc to interrupt)".as_bytes(),
            start,
        );
        assert_eq!(det.poll(start), Verdict::Working);

        let mut last = start;
        for frame in 0..600u64 {
            last = start + Duration::from_millis(1000 + frame * 100);
            let raw = format!("\x1b[3;1H\x1b[2KFile created, idle {}s\x1b[5;1H> ", frame / 10);
            feed(&mut det, raw.as_bytes(), last);
            let verdict = det.poll(last);
            // The spinner line scrolls out of the tail after a few frames
            if frame >= 3 {
                assert_ne!(verdict, Verdict::Working, "frame {}", frame);
            }
            assert!(!verdict.is_final(), "frame {}", frame);
        }

        assert!(det.state().prompt_detected_at.is_some());
        assert!(det.captured_output().lines().count() <= config.window_lines + 1);
        assert!(matches!(
            det.poll(last + Duration::from_secs(3)),
            Verdict::Success(_)
        ));
    }
}
