// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber and Delivery Loop
//!
//! [`AmqpSubscriber::subscribe`] declares and binds a queue, optionally bounds
//! its prefetch, starts a consumer and spawns one task running the delivery
//! loop for the lifetime of the connection.
//!
//! The loop handles one delivery at a time, in the order the broker pushes
//! them. Each delivery is decoded, handed to the handler once, and settled
//! exactly once through [`ack::apply`]. A delivery that cannot be decoded never
//! reaches the handler; it is rejected without requeue so the broker
//! dead-letters it instead of redelivering it forever.

use crate::{
    ack::{self, AckType},
    channel::{ChannelProvider, DeliveryStream},
    codec::{decode_envelope, BinaryCodec, Codec, JsonCodec},
    errors::AmqpError,
    otel,
    queue::QueueType,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::context::FutureExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Prefetch applied to binary subscriptions by default
pub const DEFAULT_BINARY_PREFETCH: u16 = 10;

/// Processes decoded values and reports how each delivery must be settled.
///
/// Handlers run on the subscription task; a handler that never returns stalls
/// its own queue but no other subscription.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, value: T) -> AckType;
}

#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckType + Send + Sync + 'static,
{
    async fn handle(&self, value: T) -> AckType {
        (self)(value)
    }
}

/// Consumer settings applied before consumption starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum number of unacknowledged deliveries pushed to the consumer
    pub prefetch: Option<u16>,
}

impl SubscribeOptions {
    pub fn prefetch(count: u16) -> Self {
        SubscribeOptions {
            prefetch: Some(count),
        }
    }
}

/// Counters describing what a delivery loop did before its stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub received: usize,
    pub handled: usize,
    pub undecodable: usize,
    pub settle_failures: usize,
}

/// Starts subscriptions on a connection.
#[derive(Clone)]
pub struct AmqpSubscriber {
    topology: AmqpTopology,
}

impl AmqpSubscriber {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> AmqpSubscriber {
        AmqpSubscriber {
            topology: AmqpTopology::new(provider),
        }
    }

    /// Creates a subscriber declaring its queues through `topology`.
    pub fn with_topology(topology: AmqpTopology) -> AmqpSubscriber {
        AmqpSubscriber { topology }
    }

    /// Subscribes a handler to a queue bound on `exchange`.
    ///
    /// Topology, prefetch and consumer errors are returned before anything is
    /// spawned. Once this returns Ok, a dedicated task consumes the queue until
    /// the connection closes; there is no way to cancel it.
    ///
    /// # Parameters
    /// * `exchange` - The exchange the queue is bound to
    /// * `queue_name` - The queue to declare and consume
    /// * `key` - The binding key
    /// * `queue_type` - Durable or transient lifecycle
    /// * `codec` - The codec used to decode every delivery
    /// * `options` - Consumer settings
    /// * `handler` - Invoked once per decoded delivery
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe<T, C, H>(
        &self,
        exchange: &str,
        queue_name: &str,
        key: &str,
        queue_type: QueueType,
        codec: C,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        C: Codec,
        H: Handler<T>,
    {
        let (channel, queue) = self
            .topology
            .declare_and_bind(exchange, queue_name, key, queue_type)
            .await?;

        if let Some(count) = options.prefetch {
            channel.set_prefetch(count).await?;
        }

        let deliveries = channel.consume(&queue.name).await?;
        debug!(queue = queue.name.as_str(), "consumer started");

        tokio::spawn(async move {
            // The channel lives as long as its consumer.
            let _channel = channel;
            let stats = run_delivery_loop(&queue.name, deliveries, &codec, &handler).await;
            warn!(
                queue = queue.name.as_str(),
                received = stats.received,
                "delivery stream closed"
            );
        });

        Ok(())
    }

    /// Subscribes a handler to JSON messages, without a prefetch limit.
    pub async fn subscribe_json<T, H>(
        &self,
        exchange: &str,
        queue_name: &str,
        key: &str,
        queue_type: QueueType,
        handler: H,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(
            exchange,
            queue_name,
            key,
            queue_type,
            JsonCodec,
            SubscribeOptions::default(),
            handler,
        )
        .await
    }

    /// Subscribes a handler to binary messages, with a prefetch of
    /// [`DEFAULT_BINARY_PREFETCH`] to bound memory under bursts.
    pub async fn subscribe_binary<T, H>(
        &self,
        exchange: &str,
        queue_name: &str,
        key: &str,
        queue_type: QueueType,
        handler: H,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(
            exchange,
            queue_name,
            key,
            queue_type,
            BinaryCodec,
            SubscribeOptions::prefetch(DEFAULT_BINARY_PREFETCH),
            handler,
        )
        .await
    }
}

/// Consumes `deliveries` until the stream ends.
///
/// Every delivery received is settled with exactly one ack or nack. Stream
/// errors and settle failures are logged and do not stop the loop.
pub async fn run_delivery_loop<T, C, H>(
    queue: &str,
    mut deliveries: DeliveryStream,
    codec: &C,
    handler: &H,
) -> DeliveryStats
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    let mut stats = DeliveryStats::default();

    while let Some(result) = deliveries.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), queue, "errors consume msg");
                continue;
            }
        };
        stats.received += 1;

        if delivery.redelivered {
            debug!(
                queue,
                routing_key = delivery.routing_key.as_str(),
                "redelivered message"
            );
        }

        let cx = otel::delivery_context(&delivery.headers, queue, &delivery.routing_key);

        let decoded: Result<T, AmqpError> =
            decode_envelope(codec, &delivery.payload, delivery.content_type.as_deref());

        let (decision, mut failure) = match decoded {
            Ok(value) => {
                stats.handled += 1;
                (handler.handle(value).with_context(cx.clone()).await, None)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue,
                    routing_key = delivery.routing_key.as_str(),
                    "undecodable message, rejecting without requeue"
                );
                stats.undecodable += 1;
                (AckType::NackDiscard, Some(err.to_string()))
            }
        };

        if let Err(err) = ack::apply(decision, delivery.acker.as_ref()).await {
            stats.settle_failures += 1;
            failure = Some(err.to_string());
        }

        otel::finish_span(&cx, decision, failure.as_deref());
    }

    stats
}
