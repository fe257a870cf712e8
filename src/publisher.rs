// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Encodes typed values with a [`Codec`] and sends them to an exchange under a
//! routing key. A successful publish only guarantees that the broker client
//! accepted the message; there is no broker confirm and no internal retry.

use crate::{
    channel::{AmqpChannel, ChannelProvider, OutboundMessage},
    codec::{BinaryCodec, Codec, JsonCodec},
    errors::AmqpError,
    otel,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// Publishes typed values over one channel.
///
/// A publisher owns its channel; give each concurrent task its own publisher.
pub struct AmqpPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl AmqpPublisher {
    /// Creates a publisher over an existing channel.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpPublisher {
        AmqpPublisher { channel }
    }

    /// Opens a dedicated channel on `provider` and creates a publisher over it.
    pub async fn open(provider: &dyn ChannelProvider) -> Result<AmqpPublisher, AmqpError> {
        Ok(AmqpPublisher::new(provider.create_channel().await?))
    }

    /// Publishes a value to an exchange.
    ///
    /// The value is encoded before anything reaches the broker, so an encode
    /// failure leaves the broker untouched.
    ///
    /// # Parameters
    /// * `exchange` - The target exchange
    /// * `key` - The routing key
    /// * `value` - The value to send
    /// * `codec` - The codec producing the payload and its content type
    ///
    /// # Returns
    /// Ok(()) once the broker client accepted the message, `EncodeError` or
    /// `PublishingError` otherwise
    pub async fn publish<T, C>(
        &self,
        exchange: &str,
        key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
        C: Codec,
    {
        let envelope = codec.encode(value)?;

        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let message = OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: key.to_owned(),
            envelope,
            message_id: Uuid::new_v4().to_string(),
            headers,
        };

        debug!(
            exchange,
            key,
            content_type = codec.content_type(),
            "publishing message"
        );

        self.channel.publish(message).await
    }

    /// Publishes a value encoded as JSON.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, key, value, &JsonCodec).await
    }

    /// Publishes a value with the compact binary encoding.
    pub async fn publish_binary<T>(
        &self,
        exchange: &str,
        key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, key, value, &BinaryCodec).await
    }
}
