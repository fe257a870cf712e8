// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares queues, exchanges and bindings on the broker. Every queue declared
//! through [`AmqpTopology::declare_and_bind`] dead-letters into
//! [`EXCHANGE_PERIL_DLX`](crate::routing::EXCHANGE_PERIL_DLX). All operations
//! are idempotent: repeating them with identical arguments succeeds without
//! changing broker state.

use crate::{
    channel::{AmqpChannel, ChannelProvider},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{DeclaredQueue, QueueBinding, QueueDefinition, QueueType},
    routing::{EXCHANGE_PERIL_DLX, QUEUE_PERIL_DLQ},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Declares topology on a dedicated channel per call.
#[derive(Clone)]
pub struct AmqpTopology {
    provider: Arc<dyn ChannelProvider>,
    dead_letter_exchange: String,
}

impl AmqpTopology {
    /// Creates a topology manager dead-lettering into `peril_dlx`.
    ///
    /// # Parameters
    /// * `provider` - The connection handle used to open channels
    pub fn new(provider: Arc<dyn ChannelProvider>) -> AmqpTopology {
        AmqpTopology {
            provider,
            dead_letter_exchange: EXCHANGE_PERIL_DLX.to_owned(),
        }
    }

    /// Uses another dead letter exchange for the queues declared from now on.
    pub fn with_dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = exchange.to_owned();
        self
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// The queue definition `declare_and_bind` would declare.
    pub fn queue_definition(&self, queue_name: &str, queue_type: QueueType) -> QueueDefinition {
        QueueDefinition::new(queue_name)
            .of_type(queue_type)
            .with_dead_letter(&self.dead_letter_exchange)
    }

    /// Declares a queue and binds it to an exchange.
    ///
    /// Opens a dedicated channel, declares `queue_name` with the flags of
    /// `queue_type` and the dead letter argument, then binds it to `exchange`
    /// under `key`.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to bind to; it must already exist
    /// * `queue_name` - The queue to declare
    /// * `key` - The binding key (exact key or topic pattern)
    /// * `queue_type` - Durable or transient lifecycle
    ///
    /// # Returns
    /// The channel the declaration ran on and the broker's view of the queue,
    /// or a topology error
    pub async fn declare_and_bind(
        &self,
        exchange: &str,
        queue_name: &str,
        key: &str,
        queue_type: QueueType,
    ) -> Result<(Arc<dyn AmqpChannel>, DeclaredQueue), AmqpError> {
        let channel = self.provider.create_channel().await?;

        let def = self.queue_definition(queue_name, queue_type);
        let queue = channel.declare_queue(&def).await?;

        let binding = QueueBinding::new(queue_name)
            .exchange(exchange)
            .routing_key(key);
        channel.bind_queue(&binding).await?;

        debug!(
            queue = queue.name.as_str(),
            exchange, key, "queue declared and bound"
        );

        Ok((channel, queue))
    }

    /// Declares an exchange on a dedicated channel.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.provider.create_channel().await?;
        channel.declare_exchange(def).await
    }

    /// Declares the dead letter exchange and a durable queue collecting its messages.
    ///
    /// The exchange is a durable fanout so every rejected message reaches the
    /// queue whatever its original routing key.
    ///
    /// # Parameters
    /// * `queue_name` - The dead letter queue, `peril_dlq` when `None`
    pub async fn declare_dead_letter(
        &self,
        queue_name: Option<&str>,
    ) -> Result<DeclaredQueue, AmqpError> {
        let queue_name = queue_name.unwrap_or(QUEUE_PERIL_DLQ);
        let channel = self.provider.create_channel().await?;

        channel
            .declare_exchange(
                &ExchangeDefinition::new(&self.dead_letter_exchange)
                    .fanout()
                    .durable(),
            )
            .await?;

        // The dead letter queue itself must not dead-letter into its own exchange.
        let queue = channel
            .declare_queue(&QueueDefinition::new(queue_name).of_type(QueueType::Durable))
            .await?;

        let binding = QueueBinding::new(queue_name).exchange(&self.dead_letter_exchange);
        channel.bind_queue(&binding).await.map_err(|err| {
            error!(error = err.to_string(), "failure to bind the dead letter queue");
            err
        })?;

        Ok(queue)
    }
}
