use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::booking::{BookingPolicy, BusinessHours};
use crate::clock::LocalCalendar;
use crate::queue::{QueueOptions, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid business hours {open}..={close}: need open <= close <= 23")]
    BusinessHours { open: u32, close: u32 },
    #[error("UTC offset of {0} minutes is out of range")]
    UtcOffset(i32),
}

/// Process configuration, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub policy: BookingPolicy,
    pub queue: QueueOptions,
    pub users_file: Option<PathBuf>,
    pub sessions_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = BusinessHours::default();
        let open: u32 = or(parsed(&lookup, "SLOTBOOK_OPEN_HOUR"), defaults.open_hour);
        let close: u32 = or(parsed(&lookup, "SLOTBOOK_CLOSE_HOUR"), defaults.close_hour);
        let hours = BusinessHours::new(open, close).ok_or(ConfigError::BusinessHours { open, close })?;

        let offset: i32 = or(parsed(&lookup, "SLOTBOOK_UTC_OFFSET_MINUTES"), 0);
        let calendar = LocalCalendar::with_offset_minutes(offset).ok_or(ConfigError::UtcOffset(offset))?;

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: or(parsed(&lookup, "SLOTBOOK_JOB_MAX_ATTEMPTS"), retry_defaults.max_attempts).max(1),
            delay: parsed(&lookup, "SLOTBOOK_JOB_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.delay),
        };

        Ok(Self {
            port: or(parsed(&lookup, "SLOTBOOK_PORT"), 3333),
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            compact_threshold: or(parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD"), 1000),
            policy: BookingPolicy { hours, calendar },
            queue: QueueOptions {
                workers_per_queue: or::<usize>(parsed(&lookup, "SLOTBOOK_WORKERS_PER_QUEUE"), 1).max(1),
                retry,
            },
            users_file: lookup("SLOTBOOK_USERS_FILE").map(PathBuf::from),
            sessions_file: lookup("SLOTBOOK_SESSIONS_FILE").map(PathBuf::from),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn or<T>(v: Option<T>, default: T) -> T {
    v.unwrap_or(default)
}
