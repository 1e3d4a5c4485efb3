//! Core types for the messaging service.

mod config;
mod event;

pub use config::{BrokerAddress, Credentials, MessagingConfig};
pub use event::{Event, GroupCreated};
