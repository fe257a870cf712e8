// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Well-known Exchanges, Routing Keys and Payloads
//!
//! Names shared by the game client and server processes. Per-player keys
//! follow `<feature>.<username>`, topic subscriptions use `<feature>.*`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direct exchange for point-to-point control messages (pause/resume)
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
/// Topic exchange for gameplay events (moves, wars, logs)
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
/// Exchange receiving every message rejected without requeue
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";
/// Queue bound to the dead-letter exchange
pub const QUEUE_PERIL_DLQ: &str = "peril_dlq";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Builds a per-player routing key, e.g. `pause.alice`.
pub fn player_key(prefix: &str, username: &str) -> String {
    format!("{prefix}.{username}")
}

/// Builds a topic pattern matching the given feature for any player.
pub fn any_player(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Broadcast by the server to pause or resume every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A game event persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}
