//! Durable task history
//!
//! The queue reports every status change through [`TaskHistory`]. The JSON
//! store keeps one versioned file, rewritten atomically on each update.

use crate::models::Task;
use crate::utils::lock_mutex_recover;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Version of the history file format
const HISTORY_FILE_VERSION: u32 = 1;

pub trait TaskHistory: Send + Sync {
    /// Insert the task, or replace the stored copy with the same id
    fn append_or_update(&self, task: &Task) -> Result<()>;

    /// All stored tasks in submission order
    fn load(&self) -> Result<Vec<Task>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryFile {
    version: u32,
    updated_at: DateTime<Utc>,
    tasks: Vec<Task>,
}

impl Default for HistoryFile {
    fn default() -> Self {
        Self {
            version: HISTORY_FILE_VERSION,
            updated_at: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

/// Task history kept in a single JSON file
pub struct JsonHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `~/.tui-queue/history.json`
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".tui-queue").join("history.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<HistoryFile> {
        if !self.path.exists() {
            return Ok(HistoryFile::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read history file {:?}", self.path))?;
        let file: HistoryFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history file {:?}", self.path))?;

        if file.version > HISTORY_FILE_VERSION {
            log::warn!(
                "[History] History file version {} is newer than supported version {}",
                file.version,
                HISTORY_FILE_VERSION
            );
        }
        Ok(file)
    }
}

impl TaskHistory for JsonHistoryStore {
    fn append_or_update(&self, task: &Task) -> Result<()> {
        let _guard = lock_mutex_recover(&self.write_lock);

        let mut file = self.read_file()?;
        match file.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => file.tasks.push(task.clone()),
        }
        file.version = HISTORY_FILE_VERSION;
        file.updated_at = Utc::now();

        let content = serde_json::to_string_pretty(&file)?;
        atomic_write(&self.path, content.as_bytes())
    }

    fn load(&self) -> Result<Vec<Task>> {
        let _guard = lock_mutex_recover(&self.write_lock);
        Ok(self.read_file()?.tasks)
    }
}

/// Write to a sibling temp file, then rename over the target
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}
