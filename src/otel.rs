// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Trace context travels in the AMQP message headers: the publisher injects
//! the current context, the delivery loop extracts it and opens a consumer
//! span for each delivery.

use crate::ack::AckType;
use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

const TRACER_NAME: &str = "peril-pubsub";

/// Writes trace context entries into outgoing message headers.
struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Reads trace context entries from incoming message headers.
struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("error decoding header value {:?}", e))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Injects the current trace context into `headers`.
pub(crate) fn inject_current(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector { headers })
    });
}

/// Opens a consumer span for a delivery, parented to the context it carries.
///
/// The returned context holds the span; attach it while the handler runs so
/// messages published from the handler continue the same trace.
pub(crate) fn delivery_context(
    headers: &BTreeMap<ShortString, AMQPValue>,
    queue: &str,
    routing_key: &str,
) -> Context {
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    });

    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer
        .span_builder(format!("{queue} process"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    span.set_attribute(KeyValue::new("messaging.destination.name", queue.to_owned()));
    span.set_attribute(KeyValue::new(
        "messaging.rabbitmq.destination.routing_key",
        routing_key.to_owned(),
    ));

    parent.with_span(span)
}

/// Closes the delivery span with a status derived from how it was settled.
pub(crate) fn finish_span(cx: &Context, decision: AckType, failure: Option<&str>) {
    let span = cx.span();
    span.set_attribute(KeyValue::new("messaging.peril.decision", decision.as_str()));

    match (decision, failure) {
        (_, Some(reason)) => span.set_status(Status::Error {
            description: Cow::from(reason.to_owned()),
        }),
        (AckType::Ack, None) => span.set_status(Status::Ok),
        (_, None) => span.set_status(Status::Error {
            description: Cow::from(format!("delivery rejected: {}", decision.as_str())),
        }),
    }

    span.end();
}
