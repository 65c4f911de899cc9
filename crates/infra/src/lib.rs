//! Infrastructure layer: broker adapter, configuration and the message
//! handlers that move jobs between queues.

pub mod amqp;
pub mod config;
pub mod dispatcher;
pub mod worker;

pub use amqp::AmqpBroker;
pub use config::{AmqpConfig, ConfigError, DispatcherConfig, QueueNames, WorkerConfig};
pub use dispatcher::{DispatchError, Dispatcher, NextTaskOutcome, ResultOutcome};
pub use worker::{TaskError, TaskHandler, TaskWorker, WorkOutcome, WorkerError};

#[cfg(test)]
mod integration_tests;
