//! Validating decode at the message boundaries.
//!
//! Handlers never see raw bytes: they get a typed job or a [`RejectReason`]
//! that the caller turns into a dead-letter reject.

use crate::error::RejectReason;
use crate::job::{Job, WorkerEnvelope};

/// Decode a job arriving on the intake queue and check its structure.
pub fn decode_intake(body: &[u8]) -> Result<Job, RejectReason> {
    let job: Job = parse(body)?;
    job.validate()?;
    Ok(job)
}

/// Decode a job echoed back by a worker.
///
/// A declared error is not checked here; the job is forwarded and the intake
/// side dead-letters it.
pub fn decode_result(body: &[u8]) -> Result<Job, RejectReason> {
    parse(body)
}

/// Decode the `{ content: job }` body a worker receives.
pub fn decode_envelope(body: &[u8]) -> Result<WorkerEnvelope, RejectReason> {
    let envelope: WorkerEnvelope = parse(body)?;
    if envelope.content.next_task.is_none() {
        return Err(RejectReason::MissingNextTask);
    }
    Ok(envelope)
}

/// Encode any job document for publishing.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RejectReason> {
    serde_json::from_slice(body).map_err(|e| RejectReason::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NextTask, Task};
    use serde_json::json;

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn intake_rejects_garbage_and_bad_chains() {
        assert!(matches!(
            decode_intake(b"not json"),
            Err(RejectReason::Malformed(_))
        ));
        assert_eq!(
            decode_intake(&bytes(json!({ "job": [] }))),
            Err(RejectReason::EmptyChain)
        );
        assert_eq!(
            decode_intake(&bytes(json!({ "foo": 1 }))),
            Err(RejectReason::MissingChain)
        );
        assert_eq!(
            decode_intake(&bytes(json!({ "job": [ { "id": 1, "type": "A" } ], "error": "bad input" }))),
            Err(RejectReason::DeclaredError(json!("bad input")))
        );
    }

    #[test]
    fn intake_accepts_tasks_without_inputs() {
        let job = decode_intake(&bytes(json!({ "job": [ { "id": 1, "type": "A" } ] }))).unwrap();
        assert!(job.tasks()[0].inputs.is_empty());
    }

    #[test]
    fn result_side_forwards_declared_errors() {
        let job = decode_result(&bytes(json!({ "job": [ { "id": 1, "type": "A" } ], "error": "x" }))).unwrap();
        assert!(job.declared_error().is_some());
    }

    #[test]
    fn envelope_requires_a_next_task() {
        let mut job = Job::new(vec![Task::new(1, "A", vec![])]);
        let raw = encode(&WorkerEnvelope::new(job.clone())).unwrap();
        assert_eq!(decode_envelope(&raw), Err(RejectReason::MissingNextTask));

        job.next_task = Some(NextTask {
            task: job.tasks()[0].clone(),
            idx: 0,
        });
        let raw = encode(&WorkerEnvelope::new(job.clone())).unwrap();
        assert_eq!(decode_envelope(&raw).unwrap().content, job);
    }
}
