//! Pure completion verdict over observations and timers

use super::signals::Observations;
use crate::config::DetectionConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub min_task_duration: Duration,
    pub stability: Duration,
    pub grace_period: Duration,
    pub prompt_quiet: Duration,
    pub no_output_timeout: Duration,
    pub long_running: Duration,
    pub task_timeout: Duration,
    pub change_tolerance: usize,
    pub growth_threshold: usize,
}

impl From<&DetectionConfig> for Thresholds {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            min_task_duration: Duration::from_millis(config.min_task_duration_ms),
            stability: Duration::from_millis(config.stability_threshold_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
            prompt_quiet: Duration::from_millis(config.prompt_quiet_ms),
            no_output_timeout: Duration::from_millis(config.no_output_timeout_ms),
            long_running: Duration::from_millis(config.long_running_ms),
            task_timeout: config.task_timeout(),
            change_tolerance: config.change_tolerance,
            growth_threshold: config.growth_threshold,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&DetectionConfig::default())
    }
}

/// Timers and flags tracked for the task in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionState {
    pub task_started_at: Instant,
    pub has_started_work: bool,
    pub has_confirmed_real_work: bool,
    pub prompt_detected_at: Option<Instant>,
    pub completion_phrase_detected_at: Option<Instant>,
    pub last_data_at: Instant,
    pub last_meaningful_change_at: Instant,
    pub last_significant_len: usize,
    /// Window length expected from echoing the payload alone
    pub baseline_growth: usize,
}

impl DetectionState {
    pub fn new(task_started_at: Instant, payload_len: usize) -> Self {
        Self {
            task_started_at,
            has_started_work: false,
            has_confirmed_real_work: false,
            prompt_detected_at: None,
            completion_phrase_detected_at: None,
            last_data_at: task_started_at,
            last_meaningful_change_at: task_started_at,
            last_significant_len: 0,
            baseline_growth: payload_len,
        }
    }
}

/// Signal families that can declare a task done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Prompt,
    CompletionPhrase,
    IdleTimeout,
    IdleGlyph,
    LongRunning,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Prompt => "prompt",
            Signal::CompletionPhrase => "completion_phrase",
            Signal::IdleTimeout => "idle_timeout",
            Signal::IdleGlyph => "idle_glyph",
            Signal::LongRunning => "long_running",
        }
    }

    /// Detector phase while this signal is waiting out its timers
    pub fn pending_phase(&self) -> Phase {
        match self {
            Signal::Prompt => Phase::Stabilizing,
            Signal::CompletionPhrase | Signal::LongRunning => Phase::CompletionPhraseSeen,
            Signal::IdleTimeout | Signal::IdleGlyph => Phase::IdlePending,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingWork,
    Working,
    Stabilizing,
    CompletionPhraseSeen,
    IdlePending,
    Resolved,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    AwaitingWork,
    Working,
    Pending { signal: Signal, ready_at: Instant },
    Success(Signal),
    Failure(String),
    TimedOut,
}

impl Verdict {
    pub fn phase(&self) -> Phase {
        match self {
            Verdict::AwaitingWork => Phase::AwaitingWork,
            Verdict::Working => Phase::Working,
            Verdict::Pending { signal, .. } => signal.pending_phase(),
            Verdict::Success(_) | Verdict::Failure(_) => Phase::Resolved,
            Verdict::TimedOut => Phase::TimedOut,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Verdict::Success(_) | Verdict::Failure(_) | Verdict::TimedOut
        )
    }
}

/// Decide the state of the task in flight.
///
/// Explicit errors and the hard timeout win outright. Otherwise every signal
/// whose preconditions hold gets a ready time, no earlier than the minimum
/// task duration; the earliest one that has passed resolves the task.
pub fn evaluate(
    obs: &Observations,
    state: &DetectionState,
    now: Instant,
    thresholds: &Thresholds,
) -> Verdict {
    if let Some(ref error) = obs.explicit_error {
        return Verdict::Failure(error.clone());
    }

    let start = state.task_started_at;
    if now.saturating_duration_since(start) >= thresholds.task_timeout {
        return Verdict::TimedOut;
    }

    if !state.has_started_work {
        return Verdict::AwaitingWork;
    }
    if obs.active {
        return Verdict::Working;
    }

    let stable_at = state.last_meaningful_change_at + thresholds.stability;
    let earliest = start + thresholds.min_task_duration;
    let mut candidates: Vec<(Signal, Instant)> = Vec::with_capacity(5);

    if state.has_confirmed_real_work && obs.prompt {
        if let Some(seen) = state.prompt_detected_at {
            let quiet_at = state.last_data_at + thresholds.prompt_quiet;
            candidates.push((
                Signal::Prompt,
                (seen + thresholds.grace_period).max(stable_at).max(quiet_at),
            ));
        }
    }

    if obs.completion_phrase.is_some() {
        if let Some(seen) = state.completion_phrase_detected_at {
            if state.has_confirmed_real_work {
                candidates.push((
                    Signal::CompletionPhrase,
                    (seen + thresholds.grace_period).max(stable_at),
                ));
            } else {
                candidates.push((
                    Signal::LongRunning,
                    (start + thresholds.long_running).max(stable_at),
                ));
            }
        }
    }

    candidates.push((
        Signal::IdleTimeout,
        state.last_data_at + thresholds.no_output_timeout,
    ));

    if obs.idle_glyph {
        candidates.push((Signal::IdleGlyph, stable_at));
    }

    let best = candidates
        .into_iter()
        .map(|(signal, ready_at)| (signal, ready_at.max(earliest)))
        .min_by_key(|(_, ready_at)| *ready_at);

    match best {
        Some((signal, ready_at)) if ready_at <= now => Verdict::Success(signal),
        Some((signal, ready_at)) => Verdict::Pending { signal, ready_at },
        None => Verdict::Working,
    }
}
