// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Layer
//!
//! This module provides the error taxonomy for every operation of the pub/sub
//! layer: connecting to the broker, declaring topology, encoding and decoding
//! payloads, publishing, and acknowledging deliveries.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Setup-time variants (connection, channel, declarations, qos, consumer) are
/// returned synchronously to the caller. Per-delivery variants (decode, ack,
/// nack) are logged by the delivery loop and never stop consumption.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring the prefetch limit of a channel
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// A value could not be serialized
    #[error("failure to encode payload: {0}")]
    EncodeError(String),

    /// A payload could not be deserialized
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// The delivery was tagged by a different codec than the one decoding it
    #[error("content type mismatch: expected `{expected}`, found `{found}`")]
    ContentTypeMismatch { expected: String, found: String },

    /// Error handing a message to the broker client
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error reading from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error comes from declaring or binding topology.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::ChannelError
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }

    /// Whether the error was raised while turning bytes into a value.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            AmqpError::DecodeError(_) | AmqpError::ContentTypeMismatch { .. }
        )
    }
}
