//! Reasons a job document is refused at a message boundary.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::id::TaskId;

/// Why a message cannot be processed and must go to the dead-letter path.
///
/// Every variant is permanent for the message that produced it: redelivering
/// the same bytes yields the same reason.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RejectReason {
    /// The body is not a JSON job document.
    #[error("malformed job document: {0}")]
    Malformed(String),

    /// An upstream actor attached an `error` to the job.
    #[error("job carries a declared error: {0}")]
    DeclaredError(JsonValue),

    /// The job has no chain at all.
    #[error("job has no chain")]
    MissingChain,

    /// The chain is present but has no tasks.
    #[error("job chain is empty")]
    EmptyChain,

    /// A worker envelope arrived without a task to run.
    #[error("job has no next task")]
    MissingNextTask,

    /// `nextTask.idx` does not point into the chain.
    #[error("next task index {idx} is outside a chain of {len} tasks")]
    IndexOutOfRange { idx: usize, len: usize },
}

impl RejectReason {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Failure to turn a task's back-references into literal input values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("input {input} references unknown task {task_id}")]
    UnknownTask { input: usize, task_id: TaskId },

    #[error("input {input} references task {task_id}, which has no outputs yet")]
    MissingOutputs { input: usize, task_id: TaskId },

    #[error("input {input} references output {output_index} of task {task_id}, which has {len}")]
    OutputOutOfRange {
        input: usize,
        task_id: TaskId,
        output_index: usize,
        len: usize,
    },
}
