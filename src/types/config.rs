//! Configuration types for the messaging layer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_CONSUMER_PREFETCH, DEFAULT_IDEMPOTENCY_MAX_KEYS, DEFAULT_IDEMPOTENCY_RETENTION_SECS,
    GROUP_CREATED_QUEUE,
};

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
        }
    }
}

impl BrokerAddress {
    /// `host:port/vhost`, safe to log.
    pub fn display(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    /// Full AMQP URI with credentials embedded.
    pub fn amqp_uri(&self, credentials: &Credentials) -> String {
        format!(
            "amqp://{}:{}@{}:{}{}",
            urlencoding::encode(&credentials.username),
            urlencoding::encode(&credentials.password),
            self.host,
            self.port,
            self.vhost_path(),
        )
    }

    fn vhost_path(&self) -> String {
        format!("/{}", urlencoding::encode(&self.vhost))
    }
}

/// Broker login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Global messaging service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Broker host, port and vhost
    pub broker: BrokerAddress,

    /// Broker login
    pub credentials: Credentials,

    /// Attempts made by the initial connect (1 = no retry)
    pub connect_attempts: u32,

    /// Queue carrying "group created" events
    pub group_created_queue: String,

    /// Unacknowledged deliveries allowed per consumer
    pub consumer_prefetch: u16,

    /// Return publish failures to the caller instead of dropping them
    pub publish_strict: bool,

    /// Cap on remembered idempotency keys (None = unbounded)
    pub idempotency_max_keys: Option<usize>,

    /// How long a processed key is remembered (None = forever)
    pub idempotency_retention: Option<Duration>,

    /// HTTP port for the health endpoint
    pub http_port: u16,

    /// Run against the in-process broker instead of RabbitMQ
    pub in_memory_broker: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker: BrokerAddress::default(),
            credentials: Credentials::default(),
            connect_attempts: 1,
            group_created_queue: GROUP_CREATED_QUEUE.to_string(),
            consumer_prefetch: DEFAULT_CONSUMER_PREFETCH,
            publish_strict: false,
            idempotency_max_keys: Some(DEFAULT_IDEMPOTENCY_MAX_KEYS),
            idempotency_retention: Some(Duration::from_secs(DEFAULT_IDEMPOTENCY_RETENTION_SECS)),
            http_port: 3000,
            in_memory_broker: false,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());

        Self {
            broker: BrokerAddress {
                host: lookup("RABBIT_HOST").unwrap_or(defaults.broker.host),
                port: parse_value(parse("RABBIT_PORT")).unwrap_or(defaults.broker.port),
                vhost: lookup("RABBIT_VHOST").unwrap_or(defaults.broker.vhost),
            },
            credentials: Credentials {
                username: lookup("RABBIT_USER").unwrap_or(defaults.credentials.username),
                password: lookup("RABBIT_PASS").unwrap_or(defaults.credentials.password),
            },
            connect_attempts: parse_value(parse("RABBIT_CONNECT_ATTEMPTS"))
                .unwrap_or(defaults.connect_attempts)
                .max(1),
            group_created_queue: lookup("GROUP_CREATED_QUEUE")
                .unwrap_or(defaults.group_created_queue),
            consumer_prefetch: parse_value(parse("CONSUMER_PREFETCH"))
                .unwrap_or(defaults.consumer_prefetch),
            publish_strict: parse_value(parse("PUBLISH_STRICT")).unwrap_or(defaults.publish_strict),
            // 0 disables the bound
            idempotency_max_keys: match parse_value::<usize>(parse("IDEMPOTENCY_MAX_KEYS")) {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.idempotency_max_keys,
            },
            idempotency_retention: match parse_value::<u64>(parse("IDEMPOTENCY_RETENTION_SECS")) {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.idempotency_retention,
            },
            http_port: parse_value(parse("PORT")).unwrap_or(defaults.http_port),
            in_memory_broker: parse_value(parse("BROKER_IN_MEMORY"))
                .unwrap_or(defaults.in_memory_broker),
        }
    }
}

fn parse_value<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| s.parse().ok())
}
