//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub http_addr: String,
    pub queues: QueueNames,
    pub visibility_timeout: Duration,
    pub receive_wait: Duration,
    pub receive_batch_size: u32,
    pub max_deliveries: u32,
    pub reconcile_after: Duration,
}

/// Names of the three pgmq channels the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub request: String,
    pub result: String,
    pub dead_letter: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            request: "math_queue".to_string(),
            result: "math_result_queue".to_string(),
            dead_letter: "math_dead_letter".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = QueueNames::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            queues: QueueNames {
                request: std::env::var("REQUEST_QUEUE").unwrap_or(defaults.request),
                result: std::env::var("RESULT_QUEUE").unwrap_or(defaults.result),
                dead_letter: std::env::var("DEAD_LETTER_QUEUE").unwrap_or(defaults.dead_letter),
            },
            visibility_timeout: Duration::from_secs(parsed_var("VISIBILITY_TIMEOUT_SECS", 60)?),
            receive_wait: Duration::from_secs(parsed_var("RECEIVE_WAIT_SECS", 10)?),
            receive_batch_size: parsed_var("RECEIVE_BATCH_SIZE", 10)?,
            max_deliveries: parsed_var("MAX_DELIVERIES", 5)?,
            reconcile_after: Duration::from_secs(parsed_var("RECONCILE_AFTER_SECS", 300)?),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
