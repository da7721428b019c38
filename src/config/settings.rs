//! Application settings and Telegram configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{REMINDER_INTERVAL_SECS, STOP_TIMEOUT_SECS};

/// Telegram API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram API ID (obtain from <https://my.telegram.org>).
    pub api_id: i32,

    /// Telegram API hash (obtain from <https://my.telegram.org>).
    pub api_hash: String,

    /// Token of the privileged oracle bot used for membership checks.
    pub oracle_token: String,

    /// Directory holding per-bot session files.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

impl TelegramConfig {
    /// Creates a new Telegram configuration.
    #[must_use]
    pub fn new(api_id: i32, api_hash: String, oracle_token: String) -> Self {
        Self {
            api_id,
            api_hash,
            oracle_token,
            session_dir: default_session_dir(),
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// Expects `TG_API_ID`, `TG_API_HASH` and `ORACLE_BOT_TOKEN` to be set.
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_id: i32 = std::env::var("TG_API_ID")
            .map_err(|_| ConfigError::MissingEnvVar("TG_API_ID"))?
            .parse()
            .map_err(|_| ConfigError::InvalidApiId)?;

        let api_hash = std::env::var("TG_API_HASH")
            .map_err(|_| ConfigError::MissingEnvVar("TG_API_HASH"))?;

        let oracle_token = std::env::var("ORACLE_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("ORACLE_BOT_TOKEN"))?;

        let session_dir = std::env::var("TG_SESSION_DIR")
            .map_or_else(|_| default_session_dir(), PathBuf::from);

        Ok(Self {
            api_id,
            api_hash,
            oracle_token,
            session_dir,
        })
    }

    /// Returns the session file path for one worker bot.
    #[must_use]
    pub fn worker_session_path(&self, worker_id: i64) -> PathBuf {
        self.session_dir.join(format!("worker_{worker_id}.db"))
    }

    /// Returns the session file path for the oracle bot.
    #[must_use]
    pub fn oracle_session_path(&self) -> PathBuf {
        self.session_dir.join("oracle.db")
    }
}

/// Runtime settings for the worker fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    /// Path to the worker records JSON file.
    pub workers_path: PathBuf,

    /// Seconds between reminder sends for a non-compliant user.
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_secs: u64,

    /// Seconds to wait for a dispatch loop to stop before force-cancelling.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Minimum seconds between consecutive worker starts (and stops).
    #[serde(default = "default_start_pacing")]
    pub start_pacing_secs: u64,

    /// Default per-operator limit on total channel requirements.
    #[serde(default = "default_requirement_quota")]
    pub requirement_quota: usize,
}

fn default_reminder_interval() -> u64 {
    REMINDER_INTERVAL_SECS
}

fn default_stop_timeout() -> u64 {
    STOP_TIMEOUT_SECS
}

fn default_start_pacing() -> u64 {
    1
}

fn default_requirement_quota() -> usize {
    3
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            workers_path: PathBuf::from("workers.json"),
            reminder_interval_secs: default_reminder_interval(),
            stop_timeout_secs: default_stop_timeout(),
            start_pacing_secs: default_start_pacing(),
            requirement_quota: default_requirement_quota(),
        }
    }
}

impl GateSettings {
    /// Creates gate settings from environment variables with defaults.
    #[must_use]
    pub fn from_env_with_defaults() -> Self {
        Self {
            workers_path: std::env::var("WORKERS_PATH")
                .map_or_else(|_| PathBuf::from("workers.json"), PathBuf::from),
            reminder_interval_secs: std::env::var("REMINDER_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_reminder_interval),
            stop_timeout_secs: std::env::var("STOP_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_stop_timeout),
            start_pacing_secs: std::env::var("START_PACING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_start_pacing),
            requirement_quota: std::env::var("REQUIREMENT_QUOTA")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_requirement_quota),
        }
    }

    /// Reminder cadence as a [`Duration`].
    #[must_use]
    pub const fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_secs)
    }

    /// Dispatch-loop stop timeout as a [`Duration`].
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Start/stop pacing as a [`Duration`].
    #[must_use]
    pub const fn start_pacing(&self) -> Duration {
        Duration::from_secs(self.start_pacing_secs)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Invalid API ID format (must be a positive integer)")]
    InvalidApiId,
}
