//! Job-chain state machine.
//!
//! A job moves through its chain one task at a time:
//!
//! ```text
//! intake ──advance──▶ Dispatch(nextTask = chain[i]) ──worker──▶ result
//!    ▲                                                            │
//!    └──────────────────────────merge_result──────────────────────┘
//!
//! intake ──advance──▶ Complete (every task succeeded, status = "success")
//! ```
//!
//! Everything here is pure. Each message carries a full job snapshot, so the
//! functions take the job by value and hand back the next snapshot; there is
//! no shared job table.
//!
//! Invariants maintained:
//! - a task's status only ever goes from absent to `"success"`;
//! - at most one task is referenced by `nextTask`;
//! - the job id is stamped once and never replaced.

use serde_json::Value as JsonValue;

use crate::error::{RejectReason, ResolveError};
use crate::id::JobId;
use crate::job::{Job, NextTask, Status, Task, TaskInput};

/// Type of the first task that marks a job as a rollback job.
pub const ROLLBACK_TASK_TYPE: &str = "rollback-handler";

/// Decision taken for a job that arrived on the intake queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Publish `job` (with `nextTask` set) to the queue named `queue`.
    Dispatch {
        job_id: JobId,
        queue: String,
        idx: usize,
        job: Job,
    },
    /// Every task succeeded; the job has `status = "success"`.
    Complete { job_id: JobId, job: Job },
}

impl Step {
    pub fn job(&self) -> &Job {
        match self {
            Step::Dispatch { job, .. } => job,
            Step::Complete { job, .. } => job,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Step::Dispatch { job_id, .. } => job_id.clone(),
            Step::Complete { job_id, .. } => job_id.clone(),
        }
    }
}

/// What merging a worker result did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    /// The finished task was written into `chain[idx]` and `nextTask` cleared.
    Recorded { idx: usize, job: Job },
    /// The task did not succeed; the job is forwarded as received.
    Pending(Job),
}

impl Merge {
    pub fn job(&self) -> &Job {
        match self {
            Merge::Recorded { job, .. } => job,
            Merge::Pending(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Merge::Recorded { job, .. } => job,
            Merge::Pending(job) => job,
        }
    }
}

impl Job {
    /// Structural checks applied before a job is routed anywhere.
    pub fn validate(&self) -> Result<(), RejectReason> {
        if let Some(err) = self.declared_error() {
            return Err(RejectReason::DeclaredError(err.clone()));
        }
        match &self.chain {
            None => Err(RejectReason::MissingChain),
            Some(chain) if chain.is_empty() => Err(RejectReason::EmptyChain),
            Some(_) => Ok(()),
        }
    }

    /// The job's id, assigning a fresh one if it has none yet.
    pub fn stamp_id(&mut self) -> JobId {
        self.id.get_or_insert_with(JobId::new).clone()
    }

    /// First task, in chain order, that has not succeeded.
    pub fn next_pending(&self) -> Option<(usize, &Task)> {
        self.tasks().iter().enumerate().find(|(_, t)| !t.is_success())
    }

    /// Whether the job's first task is a rollback handler.
    pub fn is_rollback(&self) -> bool {
        self.tasks()
            .first()
            .is_some_and(|t| t.task_type == ROLLBACK_TASK_TYPE)
    }

    /// Replace every back-reference in `task.inputs` with the referenced output.
    ///
    /// Outputs are looked up on the chain entries, which hold the results of
    /// tasks that have already been merged.
    pub fn resolve_inputs(&self, task: &Task) -> Result<Vec<JsonValue>, ResolveError> {
        task.inputs
            .iter()
            .enumerate()
            .map(|(input, entry)| match entry {
                TaskInput::Literal(value) => Ok(value.clone()),
                TaskInput::Reference {
                    output_of_id,
                    output_index,
                } => {
                    let source = self
                        .tasks()
                        .iter()
                        .find(|t| &t.id == output_of_id)
                        .ok_or_else(|| ResolveError::UnknownTask {
                            input,
                            task_id: output_of_id.clone(),
                        })?;
                    let outputs =
                        source
                            .outputs
                            .as_ref()
                            .ok_or_else(|| ResolveError::MissingOutputs {
                                input,
                                task_id: output_of_id.clone(),
                            })?;
                    outputs.get(*output_index).cloned().ok_or_else(|| {
                        ResolveError::OutputOutOfRange {
                            input,
                            task_id: output_of_id.clone(),
                            output_index: *output_index,
                            len: outputs.len(),
                        }
                    })
                }
            })
            .collect()
    }
}

/// Decide the next step for a job taken off the intake queue.
///
/// Stamps the id on first sight, then either points `nextTask` at the first
/// unfinished task or marks the whole job successful.
pub fn advance(mut job: Job) -> Result<Step, RejectReason> {
    job.validate()?;
    let job_id = job.stamp_id();

    let next = job
        .next_pending()
        .map(|(idx, task)| (idx, task.clone()));

    match next {
        Some((idx, task)) => {
            let queue = task.task_type.clone();
            job.next_task = Some(NextTask { task, idx });
            Ok(Step::Dispatch {
                job_id,
                queue,
                idx,
                job,
            })
        }
        None => {
            job.next_task = None;
            job.status = Some(Status::Success);
            Ok(Step::Complete { job_id, job })
        }
    }
}

/// Fold a worker's result back into the job.
///
/// Only a task reported as `"success"` is written into the chain; anything
/// else leaves the chain untouched so the same task is selected again.
pub fn merge_result(mut job: Job) -> Result<Merge, RejectReason> {
    let succeeded = job
        .next_task
        .as_ref()
        .is_some_and(|next| next.task.is_success());
    if !succeeded {
        return Ok(Merge::Pending(job));
    }

    let Some(NextTask { task, idx }) = job.next_task.take() else {
        return Ok(Merge::Pending(job));
    };
    let chain = job.chain.get_or_insert_with(Vec::new);
    let len = chain.len();
    let Some(slot) = chain.get_mut(idx) else {
        return Err(RejectReason::IndexOutOfRange { idx, len });
    };
    *slot = task;

    Ok(Merge::Recorded { idx, job })
}
