use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::ParallelPolicy;
use crate::{tlog_debug, Error, Result};

fn default_max_concurrent_steps() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

/// Engine configuration, read from `~/.tasktree/tasktree.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// In-flight step bound per task.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// Retry budget for steps that do not set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Dispatch deadline per step. None disables it.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Policy for parallel groups the task does not configure.
    #[serde(default)]
    pub default_group_policy: ParallelPolicy,
    /// Substrings classified as transient on top of the built-in list.
    #[serde(default)]
    pub extra_transient_patterns: Vec<String>,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Where trees and tasks are persisted. None keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            default_max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            step_timeout_secs: None,
            default_group_policy: ParallelPolicy::default(),
            extra_transient_patterns: Vec::new(),
            event_buffer: default_event_buffer(),
            data_dir: None,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tasktree"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("tasktree.toml"))
    }

    /// Resolved data directory, if persistence is enabled.
    pub fn data_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(expand_tilde)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at `retry_max_delay_ms`. A per-step
    /// `base_override` replaces the configured base.
    pub fn retry_delay(&self, attempt: u32, base_override: Option<u64>) -> Duration {
        let base = base_override.unwrap_or(self.retry_base_delay_ms);
        let exp = attempt.saturating_sub(1).min(31);
        let delay = base.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tlog_debug!(
            "Config loaded: max_concurrent_steps={}, default_max_retries={}, data_dir={:?}",
            config.max_concurrent_steps,
            config.default_max_retries,
            config.data_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        tlog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        if !dir.exists() {
            tlog_debug!("Creating config directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        if let Some(data) = self.data_path() {
            if !data.exists() {
                tlog_debug!("Creating data directory: {}", data.display());
                fs::create_dir_all(&data)?;
            }
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
