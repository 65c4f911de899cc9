//! Message broker abstraction (mechanics only).
//!
//! The dispatcher and workers talk to queues through the [`Broker`] trait so
//! the same handler code runs against RabbitMQ in production and the
//! in-memory broker in tests.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is neither acked nor rejected may be
//!   delivered again. Handlers must tolerate duplicates.
//! - **Explicit settlement**: every delivery is settled with [`Broker::ack`]
//!   or [`Broker::reject`]. A reject without requeue hands the message to the
//!   queue's dead-letter exchange, if it has one.
//! - **Persistent publishing**: [`Broker::publish`] always marks messages
//!   persistent and routes them by queue name through the default exchange.
//! - **No ordering across queues**.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::delivery::{Delivery, DeliveryTag};
use crate::topology::{QueueSpec, Topology};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("failed to declare {name}: {message}")]
    Declare { name: String, message: String },

    #[error("failed to consume from {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("failed to publish to {queue}: {message}")]
    Publish { queue: String, message: String },

    #[error("failed to settle delivery {tag}: {message}")]
    Settle { tag: DeliveryTag, message: String },

    #[error("broker state unavailable: {0}")]
    Unavailable(String),
}

/// A stream of deliveries from one queue.
///
/// Subscriptions are meant to be drained by a single task. `recv` returning
/// `None` means the broker closed the consumer (connection or channel gone).
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

/// Queue-based message broker with explicit acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings, in that order. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Declare a single queue. Idempotent.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    /// Start consuming from `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery. Without `requeue` the message goes
    /// to the queue's dead-letter exchange, or is dropped if it has none.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        (**self).declare(topology).await
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        (**self).declare_queue(queue).await
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        (**self).consume(queue).await
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(queue, body).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        (**self).ack(tag).await
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        (**self).reject(tag, requeue).await
    }
}
