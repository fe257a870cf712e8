// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec turns a typed value into an [`Envelope`] (bytes plus a content-type
//! tag) and back. Two codecs are provided:
//! - [`JsonCodec`]: self-describing text, tolerant of unknown fields
//! - [`BinaryCodec`]: dense `bincode` encoding, requires the exact same shape
//!   on both sides

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Content type carried by JSON encoded messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type carried by binary encoded messages
pub const BINARY_CONTENT_TYPE: &str = "application/x-bincode";

/// A unit of transmission: the encoded payload and the tag of its codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Strategy for serializing values sent through the broker.
pub trait Codec: Send + Sync + 'static {
    /// The tag stamped on every envelope this codec produces.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into an envelope.
    ///
    /// # Errors
    /// Returns `AmqpError::EncodeError` if the value cannot be represented.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Envelope, AmqpError>;

    /// Deserializes raw bytes into a value.
    ///
    /// # Errors
    /// Returns `AmqpError::DecodeError` on malformed, truncated or mismatched input.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AmqpError>;
}

/// Decodes an inbound payload, checking its content-type tag when present.
///
/// Deliveries without a tag are decoded permissively, which keeps producers
/// that never set the property working. Media type parameters are ignored and
/// the comparison is case-insensitive.
pub fn decode_envelope<C, T>(
    codec: &C,
    payload: &[u8],
    content_type: Option<&str>,
) -> Result<T, AmqpError>
where
    C: Codec,
    T: DeserializeOwned,
{
    if let Some(found) = content_type {
        // Only the media type counts: `application/json; charset=utf-8` is JSON.
        let media_type = found.split(';').next().unwrap_or_default().trim();
        if !media_type.is_empty() && !media_type.eq_ignore_ascii_case(codec.content_type()) {
            return Err(AmqpError::ContentTypeMismatch {
                expected: codec.content_type().to_owned(),
                found: found.to_owned(),
            });
        }
    }

    codec.decode(payload)
}

/// Structured text codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Envelope, AmqpError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to encode json payload");
            AmqpError::EncodeError(err.to_string())
        })?;

        Ok(Envelope {
            payload,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(payload).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

/// Compact binary codec backed by `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Envelope, AmqpError> {
        let payload = bincode::serialize(value).map_err(|err| {
            error!(error = err.to_string(), "failure to encode binary payload");
            AmqpError::EncodeError(err.to_string())
        })?;

        Ok(Envelope {
            payload,
            content_type: BINARY_CONTENT_TYPE.to_owned(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AmqpError> {
        bincode::deserialize(payload).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}
