// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection and Channels
//!
//! This module holds the seam between the pub/sub layer and the broker client.
//! [`ChannelProvider`] hands out channels, [`AmqpChannel`] is the set of AMQP
//! operations the layer needs. [`AmqpConnection`] implements both on top of
//! `lapin`; the connection is an explicit handle passed to the topology
//! manager, publishers and subscribers.
//!
//! A channel must not be shared between concurrent tasks: every subscription
//! and every publisher opens its own.

use crate::{
    ack::Acknowledger,
    codec::Envelope,
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Stream of deliveries pushed by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// A message ready to be handed to the broker client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    pub message_id: String,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

/// One delivery received from the broker.
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub acker: Box<dyn Acknowledger>,
}

/// Hands out channels on an open connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Opens a new logical channel.
    ///
    /// # Returns
    /// The channel, or `AmqpError::ChannelError` when the connection is unusable
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// The AMQP operations used by the pub/sub layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange. Redeclaring with identical parameters is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue. Redeclaring with identical parameters is a no-op.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError>;

    /// Binds a queue to an exchange under a routing key.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Bounds the number of unacknowledged deliveries pushed to consumers.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Hands a message to the broker client without waiting for a confirm.
    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;
}

/// A `lapin` connection to the broker.
pub struct AmqpConnection {
    conn: Connection,
}

impl AmqpConnection {
    /// Connects to the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Configuration holding the broker address and credentials
    ///
    /// # Returns
    /// The shared connection handle, or `AmqpError::ConnectionError`
    pub async fn connect(cfg: &Configs) -> Result<Arc<AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let conn = match Connection::connect_uri(cfg.rabbitmq.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection { conn }))
    }

    /// Closes the connection; transient queues declared on it are deleted.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError
        })
    }
}

#[async_trait]
impl ChannelProvider for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// [`AmqpChannel`] over a `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                def.declare_options(),
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", def.name);
                Ok(DeclaredQueue {
                    name: queue.name().as_str().to_owned(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        // Per consumer: every subscription owns its channel and its one consumer.
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.envelope.content_type))
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(FieldTable::from(message.headers));

        // The returned confirm is dropped: publishing only guarantees hand-off
        // to the client, never durable receipt.
        match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.envelope.payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(InboundDelivery::from(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_owned());
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();

        InboundDelivery {
            payload: delivery.data,
            content_type,
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            headers,
            acker: Box::new(LapinAcker(delivery.acker)),
        }
    }
}

/// [`Acknowledger`] over a `lapin` delivery acker.
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}
