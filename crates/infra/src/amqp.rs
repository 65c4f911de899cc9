//! RabbitMQ implementation of [`Broker`] on top of `amqprs`.
//!
//! One connection and one channel per process. Every consumer, publish and
//! settlement goes through that channel.

use amqprs::callbacks::{DefaultChannelCallback, DefaultConnectionCallback};
use amqprs::channel::{
    BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, BasicRejectArguments, Channel,
    ConsumerMessage, ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use amqprs::{BasicProperties, FieldName, FieldTable};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jobchain_broker::{
    Broker, BrokerError, Delivery, DeliveryTag, ExchangeSpec, QueueSpec, Subscription, Topology,
};

use crate::config::AmqpConfig;

const CONTENT_TYPE: &str = "application/json";

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl core::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpBroker").finish_non_exhaustive()
    }
}

impl AmqpBroker {
    /// Open the connection and the shared channel.
    pub async fn connect(config: &AmqpConfig) -> Result<Self, BrokerError> {
        let args = OpenConnectionArguments::new(
            &config.host,
            config.port,
            &config.username,
            &config.password,
        )
        .virtual_host(&config.virtual_host)
        .heartbeat(config.heartbeat)
        .finish();

        let connection = Connection::open(&args).await.map_err(connection_err)?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(connection_err)?;

        let channel = connection.open_channel(None).await.map_err(connection_err)?;
        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(connection_err)?;

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.virtual_host,
            "connected to broker"
        );
        Ok(Self { connection, channel })
    }

    /// Close the channel, then the connection.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.channel.close().await.map_err(connection_err)?;
        self.connection.close().await.map_err(connection_err)?;
        info!("broker connection closed");
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let args = ExchangeDeclareArguments::new(&exchange.name, exchange.kind.as_str())
            .durable(exchange.durable)
            .auto_delete(false)
            .finish();
        self.channel
            .exchange_declare(args)
            .await
            .map_err(|e| BrokerError::Declare {
                name: exchange.name.clone(),
                message: e.to_string(),
            })?;
        debug!(exchange = %exchange.name, kind = exchange.kind.as_str(), "exchange declared");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        for exchange in &topology.exchanges {
            self.declare_exchange(exchange).await?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue).await?;
        }
        for binding in &topology.bindings {
            let args =
                QueueBindArguments::new(&binding.queue, &binding.exchange, &binding.routing_key);
            self.channel
                .queue_bind(args)
                .await
                .map_err(|e| BrokerError::Declare {
                    name: format!("{} -> {}", binding.exchange, binding.queue),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let declare_err = |message: String| BrokerError::Declare {
            name: queue.name.clone(),
            message,
        };

        let mut arguments = FieldTable::new();
        if let Some(exchange) = &queue.dead_letter_exchange {
            let key: FieldName = "x-dead-letter-exchange"
                .try_into()
                .map_err(|e| declare_err(format!("{e:?}")))?;
            arguments.insert(key, exchange.as_str().into());
        }

        let args = QueueDeclareArguments::new(&queue.name)
            .durable(queue.durable)
            .arguments(arguments)
            .finish();
        let declared = self
            .channel
            .queue_declare(args)
            .await
            .map_err(|e| declare_err(e.to_string()))?;

        if let Some((_, messages, consumers)) = declared {
            debug!(queue = %queue.name, messages, consumers, "queue declared");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let args = BasicConsumeArguments::default()
            .queue(queue.to_string())
            .auto_ack(false)
            .finish();
        let (ctag, mut messages) =
            self.channel
                .basic_consume_rx(args)
                .await
                .map_err(|e| BrokerError::Consume {
                    queue: queue.to_string(),
                    message: e.to_string(),
                })?;
        debug!(queue, ctag = %ctag, "consumer registered");

        let (tx, rx) = mpsc::unbounded_channel();
        let name = queue.to_string();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(delivery) = to_delivery(&name, message) else {
                    warn!(queue = %name, "dropping consumer message without delivery frame");
                    continue;
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            debug!(queue = %name, "consumer stream ended");
        });

        Ok(Subscription::new(queue, rx))
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE)
            .with_persistence(true)
            .finish();
        let args = BasicPublishArguments::default()
            .routing_key(queue.to_string())
            .finish();
        self.channel
            .basic_publish(properties, body, args)
            .await
            .map_err(|e| BrokerError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(BasicAckArguments::new(tag.value(), false))
            .await
            .map_err(|e| BrokerError::Settle {
                tag,
                message: e.to_string(),
            })
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(BasicRejectArguments::new(tag.value(), requeue))
            .await
            .map_err(|e| BrokerError::Settle {
                tag,
                message: e.to_string(),
            })
    }
}

fn to_delivery(queue: &str, message: ConsumerMessage) -> Option<Delivery> {
    let deliver = message.deliver?;
    Some(Delivery::new(
        DeliveryTag::new(deliver.delivery_tag()),
        queue,
        deliver.redelivered(),
        message.content.unwrap_or_default(),
    ))
}

fn connection_err(e: amqprs::error::Error) -> BrokerError {
    BrokerError::Connection(e.to_string())
}
