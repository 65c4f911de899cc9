//! Job and task documents as they travel between the dispatcher and workers.
//!
//! The wire format is JSON with camelCase keys. Optional fields are omitted
//! when absent, and fields this crate does not know about are carried through
//! untouched so that workers can attach their own data to a job.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::id::{JobId, TaskId};

/// Progress marker on a task or job.
///
/// Only the string `"success"` has meaning. Any other value, string or not, is
/// kept as-is and treated as "not done yet".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum Status {
    Success,
    Other(JsonValue),
}

impl Status {
    pub const SUCCESS: &'static str = "success";

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl From<JsonValue> for Status {
    fn from(value: JsonValue) -> Self {
        if value.as_str() == Some(Self::SUCCESS) {
            Status::Success
        } else {
            Status::Other(value)
        }
    }
}

impl From<Status> for JsonValue {
    fn from(value: Status) -> Self {
        match value {
            Status::Success => JsonValue::from(Status::SUCCESS),
            Status::Other(v) => v,
        }
    }
}

/// One entry of a task's `inputs`.
///
/// A back-reference is resolved against the chain by the worker that runs
/// the task, never by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    Reference {
        #[serde(rename = "outputOfId")]
        output_of_id: TaskId,
        #[serde(rename = "outputIndex")]
        output_index: usize,
    },
    Literal(JsonValue),
}

impl TaskInput {
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(output_of_id: impl Into<TaskId>, output_index: usize) -> Self {
        Self::Reference {
            output_of_id: output_of_id.into(),
            output_index,
        }
    }
}

/// A single step of a job's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Task type; doubles as the name of the worker queue.
    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub inputs: Vec<TaskInput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<JsonValue>>,

    /// Advisory flag a worker sets when a dependency is temporarily down.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub missing_preconditions: bool,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<String>, inputs: Vec<TaskInput>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            inputs,
            status: None,
            outputs: None,
            missing_preconditions: false,
            extra: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.as_ref().is_some_and(Status::is_success)
    }

    /// Record a successful run with the given outputs.
    pub fn succeed(&mut self, outputs: Vec<JsonValue>) {
        self.status = Some(Status::Success);
        self.outputs = Some(outputs);
        self.missing_preconditions = false;
    }
}

/// Pointer to the task currently in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTask {
    pub task: Task,
    pub idx: usize,
}

/// The unit of work tracked end-to-end by the dispatcher.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// A falsy id (`null`, `""`, `0`, `false`) reads as absent and is
    /// replaced when the job is next stamped.
    #[serde(
        default,
        deserialize_with = "truthy_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<JobId>,

    /// Ordered tasks. Submitted as `job` (the historical key) or `chain`.
    #[serde(
        rename = "job",
        alias = "chain",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub chain: Option<Vec<Task>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<NextTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Job {
    /// A fresh, unstamped job as a client would submit it.
    pub fn new(chain: Vec<Task>) -> Self {
        Self {
            chain: Some(chain),
            ..Self::default()
        }
    }

    /// Tasks of the chain; empty when the chain is missing.
    pub fn tasks(&self) -> &[Task] {
        self.chain.as_deref().unwrap_or(&[])
    }

    pub fn is_success(&self) -> bool {
        self.status.as_ref().is_some_and(Status::is_success)
    }

    /// The declared error, if it is set to anything other than a falsy value.
    pub fn declared_error(&self) -> Option<&JsonValue> {
        self.error.as_ref().filter(|e| is_truthy(e))
    }
}

/// Body published to a worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub content: Job,
}

impl WorkerEnvelope {
    pub fn new(content: Job) -> Self {
        Self { content }
    }
}

fn truthy_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<JobId>, D::Error> {
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(raw.filter(is_truthy).map(JobId::from))
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}
