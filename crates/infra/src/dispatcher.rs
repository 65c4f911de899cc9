//! Job dispatcher: the two message handlers that drive a job through its chain.
//!
//! ```text
//! intake queue ──handle_next_task──▶ <task.type> queue ──worker──▶ result queue
//!      ▲                                                              │
//!      └────────────────────────handle_result─────────────────────────┘
//! ```
//!
//! ## Settlement
//!
//! - Every message that was routed (or that finished its job) is acked.
//! - A message that cannot be decoded, declares an `error`, has no chain, or
//!   cannot be routed is rejected without requeue. On the intake queue that
//!   lands it in the dead-letter queue.
//! - Settlement happens after the publish, so a crash in between re-delivers
//!   the message (at-least-once). Handlers are safe to re-run: the chain only
//!   moves forward and the job id is never replaced.
//!
//! The dispatcher keeps no job state between messages; each message carries
//! the full job document.

use serde::Serialize;
use thiserror::Error;

use jobchain_broker::{Broker, BrokerError, Delivery, DeliveryTag, Subscription, Topology};
use jobchain_core::{
    JobId, Merge, RejectReason, Step, WorkerEnvelope, advance, decode_intake, decode_result,
    encode, merge_result,
};

use crate::config::QueueNames;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Ack/reject/consume failed; the channel is most likely gone.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The message was valid but could not be published onward. It has been
    /// rejected to the dead-letter path.
    #[error("failed to route job to {queue}: {source}")]
    Routing { queue: String, source: BrokerError },

    #[error("failed to encode job for {queue}: {source}")]
    Encode {
        queue: String,
        source: serde_json::Error,
    },

    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),
}

impl DispatchError {
    /// Whether the dispatcher can keep consuming after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DispatchError::Routing { .. } | DispatchError::Encode { .. })
    }
}

/// What the next-task handler did with an intake message.
#[derive(Debug, Clone, PartialEq)]
pub enum NextTaskOutcome {
    /// `chain[idx]` was sent to the worker queue `queue`.
    Dispatched {
        job_id: JobId,
        queue: String,
        idx: usize,
    },
    /// Nothing left to run; the job is finished.
    Completed { job_id: JobId, rollback: bool },
    /// Dead-lettered.
    Rejected(RejectReason),
}

/// What the result handler did with a worker result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    /// The finished task was written into `chain[idx]` and the job resubmitted.
    Merged { job_id: Option<JobId>, idx: usize },
    /// The task did not succeed; the job was resubmitted as received.
    Forwarded { job_id: Option<JobId> },
    Rejected(RejectReason),
}

#[derive(Debug)]
pub struct Dispatcher<B> {
    broker: B,
    queues: QueueNames,
}

impl<B> Dispatcher<B> {
    pub fn new(broker: B, queues: QueueNames) -> Self {
        Self { broker, queues }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    pub fn into_broker(self) -> B {
        self.broker
    }
}

impl<B> Dispatcher<B>
where
    B: Broker,
{
    /// Declare the dead-letter exchange and queue, the intake queue and the
    /// result queue. Worker queues are declared by the workers themselves.
    pub async fn init(&self) -> Result<(), DispatchError> {
        self.broker
            .declare(&Topology::dispatcher(&self.queues.intake, &self.queues.result))
            .await?;
        tracing::info!(
            intake = %self.queues.intake,
            result = %self.queues.result,
            "dispatcher topology declared"
        );
        Ok(())
    }

    /// Route a job from the intake queue to the worker for its next task, or
    /// finish it when every task has succeeded.
    #[tracing::instrument(skip_all, fields(delivery_tag = %delivery.tag()))]
    pub async fn handle_next_task(
        &self,
        delivery: &Delivery,
    ) -> Result<NextTaskOutcome, DispatchError> {
        let step = match decode_intake(delivery.body()).and_then(advance) {
            Ok(step) => step,
            Err(reason) => {
                self.dead_letter(delivery.tag(), &reason).await?;
                return Ok(NextTaskOutcome::Rejected(reason));
            }
        };

        match step {
            Step::Dispatch {
                job_id,
                queue,
                idx,
                job,
            } => {
                self.route(delivery.tag(), &queue, &WorkerEnvelope::new(job))
                    .await?;
                self.broker.ack(delivery.tag()).await?;
                tracing::debug!(%job_id, %queue, idx, "task dispatched");
                Ok(NextTaskOutcome::Dispatched { job_id, queue, idx })
            }
            Step::Complete { job_id, job } => {
                let rollback = job.is_rollback();
                let tasks = job.tasks().len();
                if rollback {
                    tracing::warn!(%job_id, tasks, "rollback job completed");
                } else {
                    tracing::info!(%job_id, tasks, "job completed");
                }
                self.broker.ack(delivery.tag()).await?;
                Ok(NextTaskOutcome::Completed { job_id, rollback })
            }
        }
    }

    /// Fold a worker result into its job and send the job back to intake.
    #[tracing::instrument(skip_all, fields(delivery_tag = %delivery.tag()))]
    pub async fn handle_result(&self, delivery: &Delivery) -> Result<ResultOutcome, DispatchError> {
        let merge = match decode_result(delivery.body()).and_then(merge_result) {
            Ok(merge) => merge,
            Err(reason) => {
                self.dead_letter(delivery.tag(), &reason).await?;
                return Ok(ResultOutcome::Rejected(reason));
            }
        };

        let job_id = merge.job().id.clone();
        let outcome = match &merge {
            Merge::Recorded { idx, .. } => ResultOutcome::Merged { job_id: job_id.clone(), idx: *idx },
            Merge::Pending(_) => ResultOutcome::Forwarded { job_id: job_id.clone() },
        };

        self.route(delivery.tag(), &self.queues.intake, merge.job())
            .await?;
        self.broker.ack(delivery.tag()).await?;

        match &outcome {
            ResultOutcome::Merged { idx, .. } => {
                tracing::debug!(job_id = ?job_id, idx, "task result recorded")
            }
            _ => tracing::debug!(job_id = ?job_id, "task not successful, job resubmitted"),
        }
        Ok(outcome)
    }

    /// Consume the intake and result queues until `shutdown` resolves.
    ///
    /// Messages are handled one at a time. Routing failures are logged and
    /// consumption continues; broker failures end the loop.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send,
    {
        let mut intake = self.broker.consume(&self.queues.intake).await?;
        let mut results = self.broker.consume(&self.queues.result).await?;
        tokio::pin!(shutdown);

        tracing::info!(
            intake = %self.queues.intake,
            result = %self.queues.result,
            "dispatcher started"
        );

        let mut results_first = false;
        loop {
            let (source, delivery) = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("dispatcher received shutdown signal");
                    break;
                }
                next = next_delivery(&mut intake, &mut results, results_first) => next,
            };
            // Take turns while both queues have messages waiting.
            results_first = source == Source::Intake;

            let handled = match source {
                Source::Intake => {
                    let delivery = delivery
                        .ok_or_else(|| DispatchError::SubscriptionClosed(self.queues.intake.clone()))?;
                    self.handle_next_task(&delivery).await.map(|_| ())
                }
                Source::Results => {
                    let delivery = delivery
                        .ok_or_else(|| DispatchError::SubscriptionClosed(self.queues.result.clone()))?;
                    self.handle_result(&delivery).await.map(|_| ())
                }
            };

            match handled {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    tracing::error!(error = %err, "message dead-lettered");
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!("dispatcher stopped");
        Ok(())
    }

    /// Publish `message` to `queue`. On failure the delivery is rejected
    /// without requeue before the error is returned.
    async fn route<T: Serialize>(
        &self,
        tag: DeliveryTag,
        queue: &str,
        message: &T,
    ) -> Result<(), DispatchError> {
        let body = match encode(message) {
            Ok(body) => body,
            Err(source) => {
                self.broker.reject(tag, false).await?;
                return Err(DispatchError::Encode {
                    queue: queue.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = self.broker.publish(queue, body).await {
            if let Err(err) = self.broker.reject(tag, false).await {
                tracing::error!(queue, error = %err, "failed to reject unroutable message");
            }
            return Err(DispatchError::Routing {
                queue: queue.to_string(),
                source,
            });
        }
        Ok(())
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &RejectReason) -> Result<(), DispatchError> {
        tracing::error!(reason = %reason, "rejecting message");
        self.broker.reject(tag, false).await?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Source {
    Intake,
    Results,
}

/// Wait for the next delivery on either queue, polling `results` first when
/// `results_first` is set.
async fn next_delivery(
    intake: &mut Subscription,
    results: &mut Subscription,
    results_first: bool,
) -> (Source, Option<Delivery>) {
    if results_first {
        tokio::select! {
            biased;
            delivery = results.recv() => (Source::Results, delivery),
            delivery = intake.recv() => (Source::Intake, delivery),
        }
    } else {
        tokio::select! {
            biased;
            delivery = intake.recv() => (Source::Intake, delivery),
            delivery = results.recv() => (Source::Results, delivery),
        }
    }
}
