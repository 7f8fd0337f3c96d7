//! Taskline configuration system.
//!
//! One TOML document describes every background task:
//!
//! ```toml
//! [tasks.import]
//! chunk_size = 100
//! steps = "Extract,Load"
//!
//! [tasks.import.schedule]
//! is_enable = true
//! work_time = "00:10:00"
//!
//! [tasks.import.retry_policy]
//! every_time = 5
//! max_attempts = 10
//! ```

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TasklineError};

/// Engine-wide ceiling for `chunk_size`, whatever the configuration says.
pub const MAX_CHUNK_SIZE: usize = 5_000;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub tasks: HashMap<String, TaskSettings>,
}

impl BackgroundConfig {
    /// Load config from the default path (~/.taskline/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TasklineError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskline")
            .join("config.toml")
    }

    /// Settings of a single task.
    pub fn task(&self, name: &str) -> Option<&TaskSettings> {
        self.tasks.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            task.validate()
                .map_err(|e| TasklineError::config(format!("task '{name}': {e}")))?;
        }
        Ok(())
    }
}

/// Per-task settings; replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Max items fetched per step per tick.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub is_parallel: bool,
    /// Loop the last step back to the first instead of finalizing.
    #[serde(default)]
    pub is_infinite: bool,
    /// Ordered step names.
    #[serde(deserialize_with = "deserialize_steps")]
    pub steps: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_chunk_size() -> usize { 100 }

impl TaskSettings {
    /// Settings with the given steps and everything else defaulted.
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self {
            chunk_size: default_chunk_size(),
            is_parallel: false,
            is_infinite: false,
            steps: steps.into_iter().map(Into::into).collect(),
            schedule: ScheduleSettings::default(),
            retry_policy: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(TasklineError::config("no steps configured"));
        }
        if self.chunk_size == 0 {
            return Err(TasklineError::config("chunk_size must be at least 1"));
        }
        if let Some(policy) = &self.retry_policy {
            if policy.every_time == 0 {
                return Err(TasklineError::config(
                    "retry_policy.every_time must be at least 1",
                ));
            }
        }
        self.schedule.work_time()?;
        Ok(())
    }
}

/// Accepts either `"A, B"` or `["A", "B"]`.
fn deserialize_steps<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Steps {
        Csv(String),
        List(Vec<String>),
    }

    let names = match Steps::deserialize(deserializer)? {
        Steps::Csv(csv) => csv.split(',').map(str::to_string).collect::<Vec<_>>(),
        Steps::List(list) => list,
    };
    Ok(names
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// When a task may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "bool_true")]
    pub is_enable: bool,
    #[serde(default)]
    pub is_once: bool,
    /// Comma-separated day list: `0`-`7` (0 and 7 are Sunday) or `sun`..`sat`.
    #[serde(default = "default_work_days")]
    pub work_days: String,
    /// Tick interval, `HH:MM:SS`.
    #[serde(default = "default_work_time")]
    pub work_time: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub stop_date: Option<NaiveDate>,
    #[serde(default)]
    pub stop_time: Option<NaiveTime>,
    /// Hours added to UTC before evaluating dates, times and weekdays.
    #[serde(default)]
    pub utc_offset_hours: i8,
}

fn bool_true() -> bool { true }
fn default_work_days() -> String { "0,1,2,3,4,5,6".into() }
fn default_work_time() -> String { "00:10:00".into() }

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            is_enable: true,
            is_once: false,
            work_days: default_work_days(),
            work_time: default_work_time(),
            start_date: None,
            start_time: None,
            stop_date: None,
            stop_time: None,
            utc_offset_hours: 0,
        }
    }
}

impl ScheduleSettings {
    /// Parsed tick interval.
    pub fn work_time(&self) -> Result<Duration> {
        let time = NaiveTime::parse_from_str(self.work_time.trim(), "%H:%M:%S").map_err(|e| {
            TasklineError::config(format!("invalid work_time '{}': {e}", self.work_time))
        })?;
        let secs = u64::from(time.num_seconds_from_midnight());
        if secs == 0 {
            return Err(TasklineError::config("work_time must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }
}

/// Periodic re-fetch of failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry sweep runs when `run_counter % every_time == 0`.
    #[serde(default = "default_every_time")]
    pub every_time: u32,
    /// Upper bound on attempts, enforced by the store.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_every_time() -> u32 { 5 }
fn default_max_attempts() -> u32 { 10 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            every_time: default_every_time(),
            max_attempts: default_max_attempts(),
        }
    }
}
