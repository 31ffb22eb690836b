//! Configuration for the session supervisor, completion detector and queue
//!
//! Reads and writes a YAML file (default `~/.tui-queue/config.yaml`). Every
//! field has a default so partial files are accepted.

use crate::models::PermissionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PilotConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub usage_limit: UsageLimitConfig,
}

/// How the interactive subprocess is launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Program name or absolute path of the agent CLI
    #[serde(default = "default_command")]
    pub command: String,

    /// Extra arguments passed before any permission flags
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_rows")]
    pub rows: u16,

    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Flags appended for each permission mode (keys: default, accept_edits, skip_permissions)
    #[serde(default = "default_permission_flags")]
    pub permission_flags: HashMap<String, Vec<String>>,

    /// How long to wait for a freshly spawned session to become ready
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Quiet time after first output before the session counts as ready
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Working directory for the subprocess (defaults to the current one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_command() -> String {
    "opencode".to_string()
}

fn default_rows() -> u16 {
    30
}

fn default_cols() -> u16 {
    120
}

fn default_permission_flags() -> HashMap<String, Vec<String>> {
    let mut flags = HashMap::new();
    flags.insert(PermissionMode::Default.as_str().to_string(), Vec::new());
    flags.insert(
        PermissionMode::AcceptEdits.as_str().to_string(),
        vec!["--accept-edits".to_string()],
    );
    flags.insert(
        PermissionMode::SkipPermissions.as_str().to_string(),
        vec!["--skip-permissions".to_string()],
    );
    flags
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_settle_delay_ms() -> u64 {
    1_500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            rows: default_rows(),
            cols: default_cols(),
            permission_flags: default_permission_flags(),
            ready_timeout_ms: default_ready_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            working_dir: None,
        }
    }
}

impl SessionConfig {
    /// Full argument list for a permission mode
    pub fn args_for(&self, mode: PermissionMode) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(flags) = self.permission_flags.get(mode.as_str()) {
            args.extend(flags.iter().cloned());
        }
        args
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Completion detector thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Success is never declared before this much time has passed
    #[serde(default = "default_min_task_duration_ms")]
    pub min_task_duration_ms: u64,

    /// Output must be free of significant change for this long
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,

    /// Grace period after a prompt or completion phrase is first seen
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// No bytes for this long before a visible prompt counts
    #[serde(default = "default_prompt_quiet_ms")]
    pub prompt_quiet_ms: u64,

    /// Idle-timeout fallback
    #[serde(default = "default_no_output_timeout_ms")]
    pub no_output_timeout_ms: u64,

    /// After this long a completion phrase plus stability is enough
    #[serde(default = "default_long_running_ms")]
    pub long_running_ms: u64,

    /// Length delta (in chars) that counts as a significant change
    #[serde(default = "default_change_tolerance")]
    pub change_tolerance: usize,

    /// Growth beyond the echoed payload that counts as work starting
    #[serde(default = "default_growth_threshold")]
    pub growth_threshold: usize,

    /// Hard per-task timeout
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Lines kept in the rolling output window
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,

    /// Lines from the end scanned for active-work markers and prompts
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Optional pattern table overriding the built-in one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns_file: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_min_task_duration_ms() -> u64 {
    30_000
}

fn default_stability_threshold_ms() -> u64 {
    2_000
}

fn default_grace_period_ms() -> u64 {
    2_000
}

fn default_prompt_quiet_ms() -> u64 {
    2_000
}

fn default_no_output_timeout_ms() -> u64 {
    60_000
}

fn default_long_running_ms() -> u64 {
    5 * 60 * 1000
}

fn default_change_tolerance() -> usize {
    10
}

fn default_growth_threshold() -> usize {
    200
}

fn default_task_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_window_lines() -> usize {
    200
}

fn default_tail_lines() -> usize {
    5
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            min_task_duration_ms: default_min_task_duration_ms(),
            stability_threshold_ms: default_stability_threshold_ms(),
            grace_period_ms: default_grace_period_ms(),
            prompt_quiet_ms: default_prompt_quiet_ms(),
            no_output_timeout_ms: default_no_output_timeout_ms(),
            long_running_ms: default_long_running_ms(),
            change_tolerance: default_change_tolerance(),
            growth_threshold: default_growth_threshold(),
            task_timeout_ms: default_task_timeout_ms(),
            window_lines: default_window_lines(),
            tail_lines: default_tail_lines(),
            patterns_file: None,
        }
    }
}

impl DetectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Output throttling for downstream consumers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,

    /// Buffered text is dropped after this long without new data
    #[serde(default = "default_auto_clear_ms")]
    pub auto_clear_ms: u64,

    /// Identical blocks are not re-sent within this interval
    #[serde(default = "default_dedup_interval_ms")]
    pub dedup_interval_ms: u64,
}

fn default_throttle_interval_ms() -> u64 {
    500
}

fn default_auto_clear_ms() -> u64 {
    10_000
}

fn default_dedup_interval_ms() -> u64 {
    3_000
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval_ms(),
            auto_clear_ms: default_auto_clear_ms(),
            dedup_interval_ms: default_dedup_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
        }
    }
}

/// Queue drive-cycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Max characters written per chunk when sending a payload
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,

    /// Pause between the payload and the trailing confirm keystroke
    #[serde(default = "default_confirm_delay_ms")]
    pub confirm_delay_ms: u64,

    /// Pause between two tasks
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Start every task in a freshly spawned session
    #[serde(default)]
    pub fresh_session: bool,

    #[serde(default)]
    pub permission_mode: PermissionMode,

    /// Terminal tasks older than this are pruned
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Max terminal tasks kept after pruning
    #[serde(default = "default_max_finished")]
    pub max_finished: usize,
}

fn default_chunk_size() -> usize {
    256
}

fn default_chunk_delay_ms() -> u64 {
    50
}

fn default_confirm_delay_ms() -> u64 {
    200
}

fn default_cooldown_ms() -> u64 {
    1_000
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_finished() -> usize {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            confirm_delay_ms: default_confirm_delay_ms(),
            cooldown_ms: default_cooldown_ms(),
            fresh_session: false,
            permission_mode: PermissionMode::default(),
            retention_secs: default_retention_secs(),
            max_finished: default_max_finished(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageLimitConfig {
    /// A limit message only counts if seen within this long after task start
    #[serde(default = "default_recency_window_ms")]
    pub recency_window_ms: u64,
}

fn default_recency_window_ms() -> u64 {
    60_000
}

impl Default for UsageLimitConfig {
    fn default() -> Self {
        Self {
            recency_window_ms: default_recency_window_ms(),
        }
    }
}

impl PilotConfig {
    /// Check values that would make the detector or queue misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "session.command",
                reason: "must not be empty".to_string(),
            });
        }
        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::Invalid {
                field: "session.rows/cols",
                reason: "terminal geometry must be non-zero".to_string(),
            });
        }

        let d = &self.detection;
        if d.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "detection.poll_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if d.window_lines == 0 || d.tail_lines == 0 {
            return Err(ConfigError::Invalid {
                field: "detection.window_lines",
                reason: "window and tail sizes must be greater than 0".to_string(),
            });
        }
        if d.task_timeout_ms <= d.min_task_duration_ms {
            return Err(ConfigError::Invalid {
                field: "detection.task_timeout_ms",
                reason: format!(
                    "must exceed min_task_duration_ms ({})",
                    d.min_task_duration_ms
                ),
            });
        }
        if d.no_output_timeout_ms < d.stability_threshold_ms {
            return Err(ConfigError::Invalid {
                field: "detection.no_output_timeout_ms",
                reason: format!(
                    "must be at least stability_threshold_ms ({})",
                    d.stability_threshold_ms
                ),
            });
        }

        if self.output.throttle_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "output.throttle_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "health.interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.queue.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.chunk_size",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Manager for `~/.tui-queue/config.yaml`
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".tui-queue").join("config.yaml")))
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read and validate config, returning defaults if the file is missing
    pub fn read(&self) -> Result<PilotConfig, ConfigError> {
        if !self.config_path.exists() {
            return Ok(PilotConfig::default());
        }

        let content =
            std::fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Read {
                path: self.config_path.clone(),
                source,
            })?;

        let config: PilotConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write(&self, config: &PilotConfig) -> Result<(), ConfigError> {
        config.validate()?;

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_yaml::to_string(config)?;
        std::fs::write(&self.config_path, content).map_err(|source| ConfigError::Write {
            path: self.config_path.clone(),
            source,
        })
    }

    /// Write defaults if the file doesn't exist yet
    pub fn initialize(&self) -> Result<PilotConfig, ConfigError> {
        if self.exists() {
            return self.read();
        }

        let config = PilotConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    pub fn update<F>(&self, updater: F) -> Result<PilotConfig, ConfigError>
    where
        F: FnOnce(&mut PilotConfig),
    {
        let mut config = self.read()?;
        updater(&mut config);
        self.write(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}
