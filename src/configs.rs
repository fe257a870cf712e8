// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings for the broker, loaded from built-in defaults and
//! overridden by `PERIL__`-prefixed environment variables, e.g.
//! `PERIL__RABBITMQ__HOST=rabbit` or `PERIL__APP__LOG_LEVEL=debug`.

use config::{Config, ConfigError, Environment};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;

/// Settings describing the running application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfigs {
    /// Reported to the broker as the connection name
    pub name: String,
    pub log_level: String,
}

/// Settings used to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    ///
    /// Credentials and vhost are percent-encoded, so `/` and `@` in a
    /// password or the default vhost `/` survive the round trip.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(self.vhost_name())
        )
    }

    /// The same settings as a structured URI, without any string encoding.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost_name().to_owned(),
            ..Default::default()
        }
    }

    fn vhost_name(&self) -> &str {
        match self.vhost.as_str() {
            "/" => "/",
            vhost => vhost.trim_start_matches('/'),
        }
    }
}

fn encode(part: &str) -> String {
    utf8_percent_encode(part, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl Configs {
    /// Loads the configuration from defaults and the environment.
    pub fn load() -> Result<Configs, ConfigError> {
        Config::builder()
            .set_default("app.name", "peril")?
            .set_default("app.log_level", "info")?
            .set_default("rabbitmq.host", "localhost")?
            .set_default("rabbitmq.port", 5672)?
            .set_default("rabbitmq.user", "guest")?
            .set_default("rabbitmq.password", "guest")?
            .set_default("rabbitmq.vhost", "/")?
            .add_source(
                Environment::with_prefix("PERIL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
