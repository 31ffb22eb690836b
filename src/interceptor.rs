// Usage limit and authentication failure detection for agent output

use crate::patterns::{PatternSet, UsageLimitKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A detected usage or rate limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitInfo {
    pub kind: UsageLimitKind,
    /// The matched pattern that triggered detection
    pub matched_pattern: String,
    /// Suggested retry delay in seconds, if the message carries one
    pub retry_after_secs: Option<u64>,
    /// Human readable reset time, e.g. "3pm (Europe/Berlin)"
    pub reset_hint: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Result of classifying one chunk of output
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    None,
    UsageLimit(UsageLimitInfo),
    AuthError(String),
}

impl Interception {
    pub fn is_none(&self) -> bool {
        matches!(self, Interception::None)
    }
}

/// Scans output chunks for usage-limit and auth-failure messages
pub struct UsageLimitInterceptor {
    patterns: Arc<PatternSet>,
    recency_window: Duration,
}

impl UsageLimitInterceptor {
    pub fn new(patterns: Arc<PatternSet>, recency_window: Duration) -> Self {
        Self {
            patterns,
            recency_window,
        }
    }

    /// Classify a chunk without any timing rules. Auth failures take
    /// precedence over limits.
    pub fn classify(&self, chunk: &str) -> Interception {
        if let Some(matched) = self.patterns.auth_error(chunk) {
            return Interception::AuthError(matched);
        }

        if let Some(hit) = self.patterns.usage_limit(chunk) {
            return Interception::UsageLimit(UsageLimitInfo {
                kind: hit.kind,
                matched_pattern: hit.matched,
                retry_after_secs: self.patterns.retry_after_secs(chunk),
                reset_hint: self.patterns.reset_hint(chunk),
                detected_at: Utc::now(),
            });
        }

        Interception::None
    }

    /// Classify a chunk seen while a task is in flight.
    ///
    /// Lines echoing the task text are ignored. A usage limit only counts
    /// while `now` is inside the recency window opened at task start; older
    /// matches are leftovers from a previous screen.
    pub fn check(
        &self,
        chunk: &str,
        task_text: &str,
        task_started_at: Instant,
        now: Instant,
    ) -> Interception {
        let relevant: Vec<&str> = chunk
            .lines()
            .filter(|line| !is_echo(line, task_text))
            .collect();
        if relevant.is_empty() {
            return Interception::None;
        }

        match self.classify(&relevant.join("\n")) {
            Interception::UsageLimit(info) => {
                let age = now.saturating_duration_since(task_started_at);
                if age > self.recency_window {
                    log::debug!(
                        "[UsageLimitInterceptor] Ignoring stale limit message '{}' ({}s after task start)",
                        info.matched_pattern,
                        age.as_secs()
                    );
                    Interception::None
                } else {
                    log::warn!(
                        "[UsageLimitInterceptor] Usage limit detected: {:?} '{}'",
                        info.kind,
                        info.matched_pattern
                    );
                    Interception::UsageLimit(info)
                }
            }
            Interception::AuthError(matched) => {
                log::warn!("[UsageLimitInterceptor] Authentication failure: '{}'", matched);
                Interception::AuthError(matched)
            }
            Interception::None => Interception::None,
        }
    }
}

/// A line is an echo if it is a non-trivial substring of the submitted text
pub(crate) fn is_echo(line: &str, task_text: &str) -> bool {
    let trimmed = line.trim().trim_start_matches(['>', '❯', '›']).trim();
    trimmed.chars().count() >= 8 && task_text.contains(trimmed)
}
