//! Declarative description of exchanges, queues and bindings.

/// Exchange used for rejected intake messages.
pub const DEAD_LETTER_EXCHANGE: &str = "DeadLetterExchange";

/// Queue collecting everything routed through [`DEAD_LETTER_EXCHANGE`].
pub const DEAD_LETTER_QUEUE: &str = "DeadLetterQueue";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Everything a component declares before it starts consuming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// Dispatcher topology:
    ///
    /// ```text
    /// intake (durable, x-dead-letter-exchange) ──reject──▶ DeadLetterExchange (fanout)
    ///                                                         └──▶ DeadLetterQueue
    /// result (durable)
    /// ```
    ///
    /// Worker queues are not part of it; each worker declares its own.
    pub fn dispatcher(intake_queue: &str, result_queue: &str) -> Self {
        Self {
            exchanges: vec![ExchangeSpec::fanout(DEAD_LETTER_EXCHANGE)],
            queues: vec![
                QueueSpec::durable(DEAD_LETTER_QUEUE),
                QueueSpec::durable(intake_queue).with_dead_letter_exchange(DEAD_LETTER_EXCHANGE),
                QueueSpec::durable(result_queue),
            ],
            bindings: vec![Binding {
                queue: DEAD_LETTER_QUEUE.to_string(),
                exchange: DEAD_LETTER_EXCHANGE.to_string(),
                routing_key: String::new(),
            }],
        }
    }
}
