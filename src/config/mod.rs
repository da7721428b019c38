//! Configuration module for the subscription gate.
//!
//! Handles loading of Telegram API credentials and runtime settings
//! for the worker fleet: timer intervals, pacing delays, and the path
//! to the worker records file.

mod settings;

pub use settings::{ConfigError, GateSettings, TelegramConfig};

/// Interval between reminder sends for a non-compliant user.
pub const REMINDER_INTERVAL_SECS: u64 = 600;

/// How long to wait for a dispatch loop to finish before force-cancelling.
pub const STOP_TIMEOUT_SECS: u64 = 5;
