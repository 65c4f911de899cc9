//! Environment-driven configuration.
//!
//! Variables are read from the process environment, optionally seeded from a
//! `.env` file. Every `from_env` has a `from_lookup` twin taking an explicit
//! lookup function so parsing can be tested without touching the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            heartbeat: 60,
        }
    }
}

impl AmqpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("RABBITHOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "RABBITPORT", defaults.port)?,
            username: lookup("RABBITUSER").unwrap_or(defaults.username),
            password: lookup("RABBITPASS").unwrap_or(defaults.password),
            virtual_host: lookup("RABBITVHOST").unwrap_or(defaults.virtual_host),
            heartbeat: parse_or(&lookup, "RABBITHEARTBEAT", defaults.heartbeat)?,
        })
    }
}

/// Names of the two queues the dispatcher owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Queue carrying job documents to the next-task handler.
    pub intake: String,
    /// Queue workers publish finished tasks to.
    pub result: String,
}

impl QueueNames {
    pub fn new(intake: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            intake: intake.into(),
            result: result.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub queues: QueueNames,
    pub amqp: AmqpConfig,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            queues: QueueNames::new(
                required(&lookup, "WORKERQUEUE")?,
                required(&lookup, "RESULTSQUEUE")?,
            ),
            amqp: AmqpConfig::from_lookup(&lookup)?,
        })
    }
}

/// Settings for a single task-type worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue the worker consumes; must equal its task type.
    pub task_queue: String,
    pub result_queue: String,
    /// Wait before retrying a task whose dependency was unavailable.
    pub precondition_backoff: Duration,
    pub amqp: AmqpConfig,
}

impl WorkerConfig {
    pub const DEFAULT_PRECONDITION_BACKOFF_SECS: u64 = 30;

    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backoff_secs = parse_or(
            &lookup,
            "PRECONDITION_RETRY_SECS",
            Self::DEFAULT_PRECONDITION_BACKOFF_SECS,
        )?;
        Ok(Self {
            task_queue: required(&lookup, "WORKERQUEUE")?,
            result_queue: required(&lookup, "RESULTSQUEUE")?,
            precondition_backoff: Duration::from_secs(backoff_secs),
            amqp: AmqpConfig::from_lookup(&lookup)?,
        })
    }
}

fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
    }
}
