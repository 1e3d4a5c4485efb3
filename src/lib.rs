//! Group Messaging Library
//!
//! RabbitMQ integration layer for the groups service. Publishes domain events
//! to durable queues and consumes them with at-most-once effective processing
//! on top of the broker's at-least-once delivery.

pub mod api;
pub mod messaging;
pub mod types;

pub use messaging::{
    ConnectionManager, Consumer, EventHandler, IdempotencyTracker, InMemoryTracker,
    MessagingError, Publisher,
};
pub use types::{BrokerAddress, Credentials, Event, GroupCreated, MessagingConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::messaging::*;
    pub use crate::types::*;
}

/// Queue carrying "group created" events
pub const GROUP_CREATED_QUEUE: &str = "group_created";

/// Default number of unacknowledged deliveries per consumer
pub const DEFAULT_CONSUMER_PREFETCH: u16 = 1;

/// Default cap on remembered idempotency keys
pub const DEFAULT_IDEMPOTENCY_MAX_KEYS: usize = 100_000;

/// Default retention of idempotency keys (24h)
pub const DEFAULT_IDEMPOTENCY_RETENTION_SECS: u64 = 24 * 60 * 60;
