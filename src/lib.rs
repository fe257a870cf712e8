// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod ack;
pub mod channel;
pub mod codec;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod subscriber;
pub mod topology;
