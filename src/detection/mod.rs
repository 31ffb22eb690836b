//! Completion detection for the task in flight
//!
//! `signals` and `verdict` hold the heuristic as pure functions over the
//! output window and elapsed time; `detector` keeps the per-task timers.

pub mod detector;
pub mod signals;
pub mod verdict;

pub use detector::CompletionDetector;
pub use signals::{observe, Observations};
pub use verdict::{evaluate, DetectionState, Phase, Signal, Thresholds, Verdict};
