//! In-memory broker for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::{Broker, BrokerError, Subscription};
use crate::delivery::{Delivery, DeliveryTag};
use crate::topology::{ExchangeKind, QueueSpec, Topology};

#[derive(Debug, Default)]
struct QueueState {
    /// False for queues created implicitly by a publish.
    declared: bool,
    dead_letter_exchange: Option<String>,
    ready: VecDeque<(Vec<u8>, bool)>,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next_consumer: usize,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: u64,
    /// Every publish, kept for inspection. Never trimmed.
    published: Vec<(String, Vec<u8>)>,
}

impl State {
    fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let queue = self.queues.entry(spec.name.clone()).or_default();
        if queue.declared && queue.dead_letter_exchange != spec.dead_letter_exchange {
            return Err(BrokerError::Declare {
                name: spec.name.clone(),
                message: "inequivalent x-dead-letter-exchange".to_string(),
            });
        }
        queue.declared = true;
        queue.dead_letter_exchange = spec.dead_letter_exchange.clone();
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, body: Vec<u8>, redelivered: bool) {
        let state = self.queues.entry(queue.to_string()).or_default();
        if redelivered {
            state.ready.push_front((body, redelivered));
        } else {
            state.ready.push_back((body, redelivered));
        }
        self.pump(queue);
    }

    /// Hand ready messages to consumers, round-robin, until either runs out.
    fn pump(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            queue.consumers.retain(|tx| !tx.is_closed());
            if queue.consumers.is_empty() {
                return;
            }
            let Some((body, redelivered)) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = DeliveryTag::new(self.next_tag);
            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            let delivery = Delivery::new(tag, name, redelivered, body.clone());
            if queue.consumers[idx].send(delivery).is_err() {
                queue.consumers.remove(idx);
                queue.ready.push_front((body, redelivered));
                continue;
            }
            self.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    body,
                },
            );
        }
    }

    fn dead_letter(&mut self, queue: &str, body: Vec<u8>) {
        let exchange = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        let Some(exchange) = exchange else {
            debug!(queue, "rejected message dropped (no dead-letter exchange)");
            return;
        };

        let targets: Vec<String> = match self.exchanges.get(&exchange) {
            Some(ex) => ex
                .bindings
                .iter()
                .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == queue)
                .map(|(q, _)| q.clone())
                .collect(),
            None => Vec::new(),
        };
        if targets.is_empty() {
            debug!(queue, exchange = %exchange, "rejected message dropped (unroutable)");
        }
        for target in targets {
            self.enqueue(&target, body.clone(), false);
        }
    }

    fn take_unacked(&mut self, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        self.unacked.remove(&tag).ok_or_else(|| BrokerError::Settle {
            tag,
            message: "unknown delivery tag".to_string(),
        })
    }
}

/// In-process broker with RabbitMQ-like settlement semantics, for tests.
///
/// Every published body is retained for the broker's lifetime so tests can
/// inspect it, which makes it unsuitable for long-running processes.
///
/// - Messages wait in a queue until a consumer subscribes
/// - Round-robin delivery across a queue's consumers
/// - Unacked deliveries are tracked; `reject(requeue)` puts them back at the
///   head of the queue, flagged as redelivered
/// - `reject` without requeue routes through the queue's dead-letter exchange
///   (fanout: every bound queue; direct/topic: exact routing-key match)
/// - Publishing to an unknown queue creates it, so tests can inspect what was
///   sent to worker queues nobody declared
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-memory broker lock poisoned".to_string()))
    }

    fn inspect(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages waiting in `queue` (not yet delivered).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inspect().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.inspect().unacked.len()
    }

    /// Remove and return every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inspect()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|(body, _)| body).collect())
            .unwrap_or_default()
    }

    /// Every body published to `queue` so far, in order.
    pub fn published_to(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inspect()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Destination queue of every publish so far, in order.
    pub fn publish_log(&self) -> Vec<String> {
        self.inspect()
            .published
            .iter()
            .map(|(queue, _)| queue.clone())
            .collect()
    }

    /// Total number of publishes, across all queues.
    pub fn publish_count(&self) -> usize {
        self.inspect().published.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inspect().queues.get(queue).is_some_and(|q| q.declared)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.lock()?;

        for exchange in &topology.exchanges {
            let existing = state.exchanges.get(&exchange.name).map(|e| e.kind);
            match existing {
                Some(kind) if kind != exchange.kind => {
                    return Err(BrokerError::Declare {
                        name: exchange.name.clone(),
                        message: format!("exchange already declared as {}", kind.as_str()),
                    });
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(
                        exchange.name.clone(),
                        ExchangeState {
                            kind: exchange.kind,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
        }

        for queue in &topology.queues {
            state.declare_queue(queue)?;
        }

        for binding in &topology.bindings {
            if !state.queues.contains_key(&binding.queue) {
                return Err(BrokerError::Declare {
                    name: binding.queue.clone(),
                    message: "cannot bind an undeclared queue".to_string(),
                });
            }
            let Some(exchange) = state.exchanges.get_mut(&binding.exchange) else {
                return Err(BrokerError::Declare {
                    name: binding.exchange.clone(),
                    message: "cannot bind to an undeclared exchange".to_string(),
                });
            };
            let entry = (binding.queue.clone(), binding.routing_key.clone());
            if !exchange.bindings.contains(&entry) {
                exchange.bindings.push(entry);
            }
        }

        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.lock()?.declare_queue(queue)
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let mut state = self.lock()?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                message: "no such queue".to_string(),
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(tx);
        state.pump(queue);

        Ok(Subscription::new(queue, rx))
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.published.push((queue.to_string(), body.clone()));
        state.enqueue(queue, body, false);
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.lock()?.take_unacked(tag).map(|_| ())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let Unacked { queue, body } = state.take_unacked(tag)?;
        if requeue {
            state.enqueue(&queue, body, true);
        } else {
            state.dead_letter(&queue, body);
        }
        Ok(())
    }
}
