//! Scheduler configuration.
//!
//! Values come from defaults, optionally overridden by `DVR_*` environment
//! variables (a `.env` file is honored).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lead time before a recording's start at which its tuner is admitted.
pub const DEFAULT_RECORDING_EARLY_START_OFFSET_MS: i64 = 3_000;

/// Lead time before the next start at which the host is woken.
pub const DEFAULT_WAKE_BEFORE_START_MS: i64 = 60_000;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvrConfig {
    /// Tuner admission lead, in milliseconds.
    pub recording_early_start_offset_ms: i64,
    /// Wake-up lead, in milliseconds.
    pub wake_before_start_ms: i64,
    /// Capacity of each per-input scheduler mailbox.
    pub mailbox_capacity: usize,
    /// Capacity of the store and manager event channels.
    pub event_channel_capacity: usize,
    /// Timeout for a send into a full mailbox, in milliseconds.
    pub send_timeout_ms: u64,
    /// How long a recording task may ignore a stop or cancel before it is
    /// aborted and reported as failed. `None` waits indefinitely.
    pub task_stop_timeout_ms: Option<u64>,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            recording_early_start_offset_ms: DEFAULT_RECORDING_EARLY_START_OFFSET_MS,
            wake_before_start_ms: DEFAULT_WAKE_BEFORE_START_MS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            task_stop_timeout_ms: None,
        }
    }
}

impl DvrConfig {
    /// Load configuration from the environment on top of the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("DVR_RECORDING_EARLY_START_OFFSET_MS") {
            config.recording_early_start_offset_ms = parse_var("DVR_RECORDING_EARLY_START_OFFSET_MS", &v)?;
        }
        if let Some(v) = lookup("DVR_WAKE_BEFORE_START_MS") {
            config.wake_before_start_ms = parse_var("DVR_WAKE_BEFORE_START_MS", &v)?;
        }
        if let Some(v) = lookup("DVR_MAILBOX_CAPACITY") {
            config.mailbox_capacity = parse_var("DVR_MAILBOX_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("DVR_EVENT_CHANNEL_CAPACITY") {
            config.event_channel_capacity = parse_var("DVR_EVENT_CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("DVR_SEND_TIMEOUT_MS") {
            config.send_timeout_ms = parse_var("DVR_SEND_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("DVR_TASK_STOP_TIMEOUT_MS") {
            config.task_stop_timeout_ms = Some(parse_var("DVR_TASK_STOP_TIMEOUT_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recording_early_start_offset_ms < 0 {
            return Err(Error::config(
                "recording_early_start_offset_ms must not be negative",
            ));
        }
        if self.wake_before_start_ms < 0 {
            return Err(Error::config("wake_before_start_ms must not be negative"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be greater than 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config(
                "event_channel_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn task_stop_timeout(&self) -> Option<Duration> {
        self.task_stop_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid value for {key}: {e}")))
}
