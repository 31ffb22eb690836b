//! Phrase and marker tables used to read agent output
//!
//! The tables are plain data (`default.yaml`, embedded at build time) so they
//! can be versioned and overridden without touching the detector. A table is
//! compiled once into a [`PatternSet`]; the built-in set lives in a static.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

const DEFAULT_TABLE: &str = include_str!("default.yaml");

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Failed to read pattern file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse pattern table: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid regex in {table}: '{pattern}': {source}")]
    Regex {
        table: &'static str,
        pattern: String,
        source: regex::Error,
    },
}

/// Kind of capacity limit reported by the agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitKind {
    /// Plan or subscription usage limit
    UsageLimit,
    /// HTTP 429 Too Many Requests
    Http429,
    /// Generic rate limit message
    RateLimit,
    QuotaExceeded,
    /// Service overloaded
    Overloaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimitEntry {
    pub pattern: String,
    pub kind: UsageLimitKind,
}

/// Serialized form of the tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTable {
    pub version: u32,
    #[serde(default)]
    pub completion_phrases: Vec<String>,
    #[serde(default)]
    pub real_work_markers: Vec<String>,
    #[serde(default)]
    pub active_markers: Vec<String>,
    #[serde(default)]
    pub prompt_patterns: Vec<String>,
    #[serde(default)]
    pub idle_glyph_patterns: Vec<String>,
    #[serde(default)]
    pub error_patterns: Vec<String>,
    #[serde(default)]
    pub usage_limit_patterns: Vec<UsageLimitEntry>,
    #[serde(default)]
    pub auth_patterns: Vec<String>,
    pub retry_after_pattern: String,
    pub reset_hint_pattern: String,
}

impl PatternTable {
    pub fn builtin() -> Result<Self, PatternError> {
        Ok(serde_yaml::from_str(DEFAULT_TABLE)?)
    }

    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// A usage-limit pattern hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitMatch {
    pub kind: UsageLimitKind,
    pub matched: String,
}

/// Compiled pattern tables
#[derive(Debug)]
pub struct PatternSet {
    version: u32,
    completion_phrases: Vec<String>,
    real_work: Vec<Regex>,
    active: Vec<Regex>,
    prompt: Vec<Regex>,
    idle_glyph: Vec<Regex>,
    errors: Vec<Regex>,
    usage_limits: Vec<(Regex, UsageLimitKind)>,
    auth: Vec<Regex>,
    retry_after: Regex,
    reset_hint: Regex,
}

static BUILTIN: OnceLock<Arc<PatternSet>> = OnceLock::new();

fn compile(table: &'static str, patterns: &[String]) -> Result<Vec<Regex>, PatternError> {
    patterns.iter().map(|p| compile_one(table, p)).collect()
}

fn compile_one(table: &'static str, pattern: &str) -> Result<Regex, PatternError> {
    Regex::new(pattern).map_err(|source| PatternError::Regex {
        table,
        pattern: pattern.to_string(),
        source,
    })
}

impl PatternSet {
    /// The embedded tables, compiled on first use
    pub fn builtin() -> Arc<PatternSet> {
        BUILTIN
            .get_or_init(|| {
                let set = PatternTable::builtin()
                    .and_then(|table| PatternSet::compile(&table))
                    .expect("embedded pattern table must compile");
                Arc::new(set)
            })
            .clone()
    }

    /// Load an override table from disk
    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let table = PatternTable::load(path)?;
        log::info!(
            "[Patterns] Loaded pattern table v{} from {:?}",
            table.version,
            path
        );
        Self::compile(&table)
    }

    pub fn compile(table: &PatternTable) -> Result<Self, PatternError> {
        let usage_limits = table
            .usage_limit_patterns
            .iter()
            .map(|entry| Ok((compile_one("usage_limit_patterns", &entry.pattern)?, entry.kind)))
            .collect::<Result<Vec<_>, PatternError>>()?;

        Ok(Self {
            version: table.version,
            completion_phrases: table
                .completion_phrases
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            real_work: compile("real_work_markers", &table.real_work_markers)?,
            active: compile("active_markers", &table.active_markers)?,
            prompt: compile("prompt_patterns", &table.prompt_patterns)?,
            idle_glyph: compile("idle_glyph_patterns", &table.idle_glyph_patterns)?,
            errors: compile("error_patterns", &table.error_patterns)?,
            usage_limits,
            auth: compile("auth_patterns", &table.auth_patterns)?,
            retry_after: compile_one("retry_after_pattern", &table.retry_after_pattern)?,
            reset_hint: compile_one("reset_hint_pattern", &table.reset_hint_pattern)?,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// First completion phrase contained in `text` (case-insensitive)
    pub fn completion_phrase(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.completion_phrases
            .iter()
            .find(|phrase| lower.contains(phrase.as_str()))
            .map(|s| s.as_str())
    }

    pub fn is_real_work(&self, line: &str) -> bool {
        self.real_work.iter().any(|r| r.is_match(line))
    }

    pub fn is_active(&self, line: &str) -> bool {
        self.active.iter().any(|r| r.is_match(line))
    }

    pub fn is_prompt(&self, line: &str) -> bool {
        self.prompt.iter().any(|r| r.is_match(line))
    }

    pub fn is_idle_glyph(&self, line: &str) -> bool {
        self.idle_glyph.iter().any(|r| r.is_match(line))
    }

    /// Matched text of the first explicit error pattern
    pub fn explicit_error(&self, text: &str) -> Option<String> {
        self.errors
            .iter()
            .find_map(|r| r.find(text).map(|m| m.as_str().to_string()))
    }

    /// First usage-limit pattern found, in table order
    pub fn usage_limit(&self, text: &str) -> Option<LimitMatch> {
        self.usage_limits.iter().find_map(|(regex, kind)| {
            regex.find(text).map(|m| LimitMatch {
                kind: *kind,
                matched: m.as_str().to_string(),
            })
        })
    }

    pub fn auth_error(&self, text: &str) -> Option<String> {
        self.auth
            .iter()
            .find_map(|r| r.find(text).map(|m| m.as_str().to_string()))
    }

    /// Retry-after delay in seconds, when the message carries one
    pub fn retry_after_secs(&self, text: &str) -> Option<u64> {
        self.retry_after
            .captures(text)
            .and_then(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
    }

    /// Free-form reset hint such as "3pm (Europe/Berlin)"
    pub fn reset_hint(&self, text: &str) -> Option<String> {
        self.reset_hint
            .captures(text)
            .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
    }
}
