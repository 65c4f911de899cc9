//! Job documents and the chain state machine.
//!
//! This crate is pure: no IO, no async. The dispatcher and workers call into
//! it at their message boundaries.

pub mod chain;
pub mod decode;
pub mod error;
pub mod id;
pub mod job;

pub use chain::{Merge, ROLLBACK_TASK_TYPE, Step, advance, merge_result};
pub use decode::{decode_envelope, decode_intake, decode_result, encode};
pub use error::{RejectReason, ResolveError};
pub use id::{JobId, TaskId};
pub use job::{Job, NextTask, Status, Task, TaskInput, WorkerEnvelope};
