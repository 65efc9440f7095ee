//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! number does not parse. The database URL is wrapped in
//! secrecy::SecretString so it never shows up in logs.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::engine::{ClaimPolicy, RetryPolicy};
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub claim_max_attempts: u32,
    pub claim_max_jitter: Duration,
    pub requeue_delay: Duration,
    pub requeue_multiplier: f64,
    pub requeue_max_delay: Duration,
    pub reaper_interval: Duration,
    pub sweep_interval: Duration,
    pub retention_days: u64,
    pub callback_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })?;

        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|v| !v.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            claim_max_attempts: parse_or(&lookup, "TASKQ_CLAIM_MAX_ATTEMPTS", 3)?,
            claim_max_jitter: Duration::from_millis(parse_or(
                &lookup,
                "TASKQ_CLAIM_MAX_JITTER_MS",
                250,
            )?),
            requeue_delay: secs(&lookup, "TASKQ_REQUEUE_DELAY_SECS", 0)?,
            requeue_multiplier: parse_or(&lookup, "TASKQ_REQUEUE_MULTIPLIER", 2.0)?,
            requeue_max_delay: secs(&lookup, "TASKQ_REQUEUE_MAX_DELAY_SECS", 3600)?,
            reaper_interval: secs(&lookup, "TASKQ_REAPER_INTERVAL_SECS", 30)?,
            sweep_interval: secs(&lookup, "TASKQ_SWEEP_INTERVAL_SECS", 3600)?,
            retention_days: parse_or(&lookup, "TASKQ_RETENTION_DAYS", 7)?,
            callback_timeout: secs(&lookup, "TASKQ_CALLBACK_TIMEOUT_SECS", 10)?,
        })
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            max_attempts: self.claim_max_attempts.max(1),
            max_jitter: self.claim_max_jitter,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.requeue_delay,
            multiplier: self.requeue_multiplier,
            max_delay: self.requeue_max_delay,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    parse_or(lookup, name, default).map(Duration::from_secs)
}
