//! Runtime for task-type workers.
//!
//! A worker consumes the queue named after its task type, runs the task in
//! `nextTask` and reports the whole job to the result queue:
//!
//! - success: `status = "success"` and `outputs` are set on `nextTask.task`
//! - failure: the job is reported untouched, so the dispatcher re-selects the
//!   same task
//! - missing preconditions: the task is flagged, the worker waits, then puts
//!   the job back on its own queue. The dispatcher never sees these.
//!
//! Task logic plugs in through [`TaskHandler`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use jobchain_broker::{Broker, BrokerError, Delivery, QueueSpec};
use jobchain_core::{
    Job, JobId, RejectReason, Task, TaskId, WorkerEnvelope, decode_envelope, encode,
};

use crate::config::WorkerConfig;

/// Why a handler could not finish a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task ran and failed. It will be retried when the job comes back.
    #[error("task failed: {0}")]
    Failed(String),

    /// A dependency is unavailable; retry once it is back.
    #[error("missing preconditions: {0}")]
    MissingPreconditions(String),
}

/// The work behind one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler serves; also the queue it consumes.
    fn task_type(&self) -> &str;

    /// Run `task` with its back-references already resolved into `inputs`.
    async fn handle(&self, task: &Task, inputs: Vec<JsonValue>)
    -> Result<Vec<JsonValue>, TaskError>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Outputs recorded and the job reported.
    Succeeded {
        job_id: Option<JobId>,
        task_id: TaskId,
    },
    /// Reported without success; the dispatcher will send it again.
    Failed {
        job_id: Option<JobId>,
        task_id: TaskId,
        reason: String,
    },
    /// Flagged `missingPreconditions` and put back on the worker's queue.
    Deferred {
        job_id: Option<JobId>,
        task_id: TaskId,
    },
    /// Not a worker envelope; rejected without requeue.
    Rejected(RejectReason),
}

#[derive(Debug)]
pub struct TaskWorker<B, H> {
    broker: B,
    handler: H,
    result_queue: String,
    precondition_backoff: Duration,
}

impl<B, H> TaskWorker<B, H> {
    pub fn new(broker: B, handler: H, result_queue: impl Into<String>) -> Self {
        Self {
            broker,
            handler,
            result_queue: result_queue.into(),
            precondition_backoff: Duration::from_secs(WorkerConfig::DEFAULT_PRECONDITION_BACKOFF_SECS),
        }
    }

    pub fn with_precondition_backoff(mut self, backoff: Duration) -> Self {
        self.precondition_backoff = backoff;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }
}

impl<B, H> TaskWorker<B, H>
where
    B: Broker,
    H: TaskHandler,
{
    /// Declare the worker's own queue and the result queue.
    pub async fn init(&self) -> Result<(), WorkerError> {
        self.broker
            .declare_queue(&QueueSpec::durable(self.handler.task_type()))
            .await?;
        self.broker
            .declare_queue(&QueueSpec::durable(&self.result_queue))
            .await?;
        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        fields(task_type = self.handler.task_type(), delivery_tag = %delivery.tag())
    )]
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<WorkOutcome, WorkerError> {
        let (mut job, task) = match decode_envelope(delivery.body()) {
            Ok(WorkerEnvelope { content }) => match content.next_task.as_ref() {
                Some(next) => {
                    let task = next.task.clone();
                    (content, task)
                }
                None => return self.reject(delivery, RejectReason::MissingNextTask).await,
            },
            Err(reason) => return self.reject(delivery, reason).await,
        };
        let job_id = job.id.clone();
        let task_id = task.id.clone();

        let result = match job.resolve_inputs(&task) {
            Ok(inputs) => self.handler.handle(&task, inputs).await,
            Err(err) => Err(TaskError::Failed(err.to_string())),
        };

        let outcome = match result {
            Ok(outputs) => {
                if let Some(next) = job.next_task.as_mut() {
                    next.task.succeed(outputs);
                }
                self.report(&job).await?;
                tracing::debug!(job_id = ?job_id, task_id = %task_id, "task succeeded");
                WorkOutcome::Succeeded { job_id, task_id }
            }
            Err(TaskError::Failed(reason)) => {
                tracing::warn!(job_id = ?job_id, task_id = %task_id, %reason, "task failed");
                self.report(&job).await?;
                WorkOutcome::Failed {
                    job_id,
                    task_id,
                    reason,
                }
            }
            Err(TaskError::MissingPreconditions(reason)) => {
                tracing::warn!(
                    job_id = ?job_id,
                    task_id = %task_id,
                    %reason,
                    backoff = ?self.precondition_backoff,
                    "task preconditions missing, deferring"
                );
                if let Some(next) = job.next_task.as_mut() {
                    next.task.missing_preconditions = true;
                }
                tokio::time::sleep(self.precondition_backoff).await;
                self.broker
                    .publish(self.handler.task_type(), encode(&WorkerEnvelope::new(job))?)
                    .await?;
                WorkOutcome::Deferred { job_id, task_id }
            }
        };

        self.broker.ack(delivery.tag()).await?;
        Ok(outcome)
    }

    /// Consume the worker's queue until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        self.init().await?;
        let queue = self.handler.task_type();
        let mut subscription = self.broker.consume(queue).await?;
        tokio::pin!(shutdown);

        tracing::info!(queue, result = %self.result_queue, "worker started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(queue, "worker received shutdown signal");
                    break;
                }
                delivery = subscription.recv() => {
                    let delivery = delivery
                        .ok_or_else(|| WorkerError::SubscriptionClosed(queue.to_string()))?;
                    self.handle_delivery(&delivery).await?;
                }
            }
        }
        Ok(())
    }

    async fn report(&self, job: &Job) -> Result<(), WorkerError> {
        self.broker.publish(&self.result_queue, encode(job)?).await?;
        Ok(())
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        reason: RejectReason,
    ) -> Result<WorkOutcome, WorkerError> {
        tracing::error!(reason = %reason, "rejecting worker message");
        self.broker.reject(delivery.tag(), false).await?;
        Ok(WorkOutcome::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobchain_broker::InMemoryBroker;
    use jobchain_core::{NextTask, TaskInput};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RESULTS: &str = "results";

    /// Upper-cases its single string input.
    struct Shout;

    #[async_trait]
    impl TaskHandler for Shout {
        fn task_type(&self) -> &str {
            "shout"
        }

        async fn handle(
            &self,
            _task: &Task,
            inputs: Vec<JsonValue>,
        ) -> Result<Vec<JsonValue>, TaskError> {
            match inputs.first().and_then(JsonValue::as_str) {
                Some(s) => Ok(vec![json!(s.to_uppercase())]),
                None => Err(TaskError::Failed("expected a string input".to_string())),
            }
        }
    }

    /// Reports missing preconditions until it has been called `ready_after` times.
    struct Flaky {
        calls: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        fn task_type(&self) -> &str {
            "flaky"
        }

        async fn handle(
            &self,
            _task: &Task,
            _inputs: Vec<JsonValue>,
        ) -> Result<Vec<JsonValue>, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.ready_after {
                return Err(TaskError::MissingPreconditions("database down".to_string()));
            }
            Ok(vec![])
        }
    }

    /// A job whose first task produced `"y"` and whose second task, of
    /// `task_type`, is in flight.
    fn envelope(task_type: &str, input: TaskInput) -> WorkerEnvelope {
        let mut first = Task::new(1, "A", vec![]);
        first.succeed(vec![json!("y")]);
        let second = Task::new(2, task_type, vec![input]);
        let mut job = Job::new(vec![first, second.clone()]);
        job.stamp_id();
        job.next_task = Some(NextTask {
            task: second,
            idx: 1,
        });
        WorkerEnvelope::new(job)
    }

    async fn worker<H: TaskHandler>(handler: H) -> TaskWorker<InMemoryBroker, H> {
        let worker = TaskWorker::new(InMemoryBroker::new(), handler, RESULTS)
            .with_precondition_backoff(Duration::from_secs(5));
        worker.init().await.unwrap();
        worker
    }

    async fn deliver<H: TaskHandler>(w: &TaskWorker<InMemoryBroker, H>, body: Vec<u8>) -> Delivery {
        let queue = w.handler.task_type();
        w.broker().publish(queue, body).await.unwrap();
        let mut sub = w.broker().consume(queue).await.unwrap();
        sub.try_recv().unwrap()
    }

    fn reported(w: &TaskWorker<InMemoryBroker, impl TaskHandler>) -> Job {
        let mut bodies = w.broker().drain(RESULTS);
        assert_eq!(bodies.len(), 1);
        serde_json::from_slice(&bodies.remove(0)).unwrap()
    }

    #[tokio::test]
    async fn success_records_outputs_on_next_task() {
        let w = worker(Shout).await;
        let env = envelope("shout", TaskInput::reference(1, 0));
        let delivery = deliver(&w, serde_json::to_vec(&env).unwrap()).await;

        let outcome = w.handle_delivery(&delivery).await.unwrap();

        assert_eq!(
            outcome,
            WorkOutcome::Succeeded {
                job_id: env.content.id.clone(),
                task_id: TaskId::from(2),
            }
        );
        let job = reported(&w);
        let next = job.next_task.unwrap();
        assert!(next.task.is_success());
        assert_eq!(next.task.outputs, Some(vec![json!("Y")]));
        assert_eq!(next.idx, 1);
        // The chain itself is the dispatcher's to update.
        assert_eq!(job.chain, env.content.chain);
        assert_eq!(w.broker().unacked_count(), 0);
    }

    #[tokio::test]
    async fn handler_failure_reports_job_unchanged() {
        let w = worker(Shout).await;
        let env = envelope("shout", TaskInput::literal(42));
        let delivery = deliver(&w, serde_json::to_vec(&env).unwrap()).await;

        let outcome = w.handle_delivery(&delivery).await.unwrap();

        assert!(matches!(outcome, WorkOutcome::Failed { .. }));
        assert_eq!(reported(&w), env.content);
        assert_eq!(w.broker().unacked_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_inputs_count_as_failure() {
        let w = worker(Shout).await;
        let env = envelope("shout", TaskInput::reference(7, 0));
        let delivery = deliver(&w, serde_json::to_vec(&env).unwrap()).await;

        let outcome = w.handle_delivery(&delivery).await.unwrap();

        let WorkOutcome::Failed { reason, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("unknown task 7"), "{reason}");
        assert!(!reported(&w).next_task.unwrap().task.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_preconditions_defer_to_own_queue() {
        let w = worker(Flaky {
            calls: AtomicUsize::new(0),
            ready_after: 1,
        })
        .await;
        let env = envelope("flaky", TaskInput::literal("x"));
        let delivery = deliver(&w, serde_json::to_vec(&env).unwrap()).await;

        let started = tokio::time::Instant::now();
        let outcome = w.handle_delivery(&delivery).await.unwrap();

        assert!(matches!(outcome, WorkOutcome::Deferred { .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(w.broker().queue_depth(RESULTS), 0);

        let mut requeued = w.broker().drain("flaky");
        assert_eq!(requeued.len(), 1);
        let retry: WorkerEnvelope = serde_json::from_slice(&requeued[0]).unwrap();
        assert!(retry.content.next_task.as_ref().unwrap().task.missing_preconditions);

        // Second attempt succeeds and clears the flag.
        let delivery = deliver(&w, requeued.remove(0)).await;
        let outcome = w.handle_delivery(&delivery).await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Succeeded { .. }));
        let task = reported(&w).next_task.unwrap().task;
        assert!(task.is_success());
        assert!(!task.missing_preconditions);
    }

    #[tokio::test]
    async fn non_envelopes_are_rejected() {
        let w = worker(Shout).await;

        let delivery = deliver(&w, b"[]".to_vec()).await;
        let outcome = w.handle_delivery(&delivery).await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Rejected(RejectReason::Malformed(_))));

        let bare = WorkerEnvelope::new(Job::new(vec![Task::new(1, "shout", vec![])]));
        let delivery = deliver(&w, serde_json::to_vec(&bare).unwrap()).await;
        let outcome = w.handle_delivery(&delivery).await.unwrap();
        assert_eq!(outcome, WorkOutcome::Rejected(RejectReason::MissingNextTask));

        assert_eq!(w.broker().publish_count(), 2);
        assert_eq!(w.broker().unacked_count(), 0);
    }
}
