//! Identifiers carried inside job documents.

use core::convert::Infallible;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Identifier of a job.
///
/// The dispatcher stamps a UUIDv7 on first sight. Clients may bring their own
/// id instead; anything that is not a canonical UUID string is kept exactly as
/// it was submitted (`42`, `"job-7"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobId {
    Uuid(Uuid),
    Client(JsonValue),
}

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self::Uuid(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }

    /// Only the canonical hyphenated form becomes [`JobId::Uuid`], so the id
    /// serializes back to the exact string it was read from.
    fn from_text(s: String) -> Self {
        match Uuid::parse_str(&s) {
            Ok(uuid) if uuid.hyphenated().to_string() == s => Self::Uuid(uuid),
            _ => Self::Client(JsonValue::String(s)),
        }
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            JobId::Uuid(uuid) => Some(uuid),
            JobId::Client(_) => None,
        }
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobId::Uuid(uuid) => core::fmt::Display::fmt(uuid, f),
            JobId::Client(JsonValue::String(s)) => f.write_str(s),
            JobId::Client(other) => write!(f, "{other}"),
        }
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<JsonValue> for JobId {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::String(s) => Self::from_text(s),
            other => Self::Client(other),
        }
    }
}

impl FromStr for JobId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_text(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Self::from)
    }
}

/// Identifier of a task within its job's chain.
///
/// Clients submit either numbers (`"id": 123`) or strings; both are accepted
/// and compared by value, so `123` and `"123"` are different tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(i64),
    Text(String),
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TaskId::Number(n) => write!(f, "{n}"),
            TaskId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for TaskId {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
