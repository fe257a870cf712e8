// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Policy
//!
//! Handlers report the outcome of a delivery as an [`AckType`]. [`apply`] is
//! the single place where that outcome becomes a broker call, so every
//! delivery is settled exactly once.

use crate::errors::AmqpError;
use async_trait::async_trait;
use tracing::{debug, error};

/// The outcome a handler reports for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Handled; remove the message from the queue.
    Ack,
    /// Transient failure; put the message back for another attempt.
    NackRequeue,
    /// Permanent failure; reject and let the broker dead-letter it.
    NackDiscard,
}

impl AckType {
    /// Maps a raw decision code to a decision.
    ///
    /// `0`, `1` and `2` are `Ack`, `NackRequeue` and `NackDiscard`. Anything
    /// else fails closed to `NackDiscard`.
    pub fn from_code(code: u8) -> AckType {
        match code {
            0 => AckType::Ack,
            1 => AckType::NackRequeue,
            _ => AckType::NackDiscard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckType::Ack => "ack",
            AckType::NackRequeue => "nack_requeue",
            AckType::NackDiscard => "nack_discard",
        }
    }
}

impl From<u8> for AckType {
    fn from(code: u8) -> Self {
        AckType::from_code(code)
    }
}

/// Settles a delivery on the broker.
///
/// One value is handed to every delivery; it must see exactly one of its
/// methods called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges the delivery, removing it from the queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery, optionally putting it back on the queue.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Applies a handler decision to the broker with exactly one call.
///
/// # Parameters
/// * `decision` - The outcome returned by the handler
/// * `acker` - The acknowledger of the delivery being settled
///
/// # Returns
/// Ok(()) on success or the ack/nack error reported by the broker client
pub async fn apply(decision: AckType, acker: &dyn Acknowledger) -> Result<(), AmqpError> {
    let result = match decision {
        AckType::Ack => acker.ack().await,
        AckType::NackRequeue => acker.nack(true).await,
        AckType::NackDiscard => acker.nack(false).await,
    };

    match result {
        Ok(()) => {
            debug!(decision = decision.as_str(), "delivery settled");
            Ok(())
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                decision = decision.as_str(),
                "failure to settle delivery"
            );
            Err(err)
        }
    }
}
