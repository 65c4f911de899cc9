//! Queue broker abstraction.
//!
//! Transport-agnostic: handlers are written against [`Broker`], and the
//! AMQP adapter in `jobchain-infra` or the [`InMemoryBroker`] provide it.

pub mod broker;
pub mod delivery;
pub mod in_memory;
pub mod topology;

pub use broker::{Broker, BrokerError, Subscription};
pub use delivery::{Delivery, DeliveryTag};
pub use in_memory::InMemoryBroker;
pub use topology::{
    Binding, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, ExchangeKind, ExchangeSpec, QueueSpec,
    Topology,
};
