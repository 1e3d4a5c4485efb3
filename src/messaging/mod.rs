//! # Messaging Module
//!
//! RabbitMQ integration for the groups service.
//!
//! ## Features
//! - Single broker connection with one channel per direction
//! - Fire-and-forget publishing to durable queues with persistent messages
//! - Manual-ack consumption with idempotency tracking and graceful shutdown
//! - In-memory broker implementing the same traits

pub mod backoff;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod publisher;
pub mod rabbit_client;

pub use backoff::{Backoff, ConnectRetry};
pub use broker::{BrokerChannel, BrokerChannels, BrokerConnection, BrokerConnector, Delivery};
pub use connection::ConnectionManager;
pub use consumer::{
    handler_fn, Consumer, ConsumerConfig, ConsumerHandle, ConsumerStats, ConsumerStatus,
    DeliveryOutcome, EventHandler,
};
pub use error::MessagingError;
pub use idempotency::{IdempotencyTracker, InMemoryTracker, TrackerConfig};
pub use memory::{InMemoryBroker, Rejection};
pub use publisher::{PublishMode, Publisher};
pub use rabbit_client::AmqpConnector;
