//! Outbound event publishing.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use super::connection::ConnectionManager;
use super::error::{MessagingError, Result};
use crate::types::{Event, MessagingConfig};

/// What a publish does when it cannot deliver to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Log and drop. The caller always gets `Ok(())`.
    #[default]
    BestEffort,
    /// Return the error to the caller.
    Strict,
}

impl PublishMode {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            PublishMode::Strict
        } else {
            PublishMode::BestEffort
        }
    }
}

/// Sends domain events to durable queues.
///
/// Publishing is fire-and-forget: it never waits for the broker to confirm
/// the message. Under [`PublishMode::BestEffort`] an event published before
/// the broker connection exists is dropped with a warning, which loses the
/// event silently from the caller's point of view.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    mode: PublishMode,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self::with_mode(connections, PublishMode::default())
    }

    pub fn with_mode(connections: Arc<ConnectionManager>, mode: PublishMode) -> Self {
        Self { connections, mode }
    }

    /// Publisher whose mode follows `PUBLISH_STRICT`.
    pub fn from_messaging(connections: Arc<ConnectionManager>, config: &MessagingConfig) -> Self {
        Self::with_mode(connections, PublishMode::from_strict_flag(config.publish_strict))
    }

    /// Publish `event` to `queue`, declaring the queue durable first.
    #[instrument(skip(self, event), fields(key = ?event.idempotency_key()))]
    pub async fn publish(&self, queue: &str, event: &Event) -> Result<()> {
        match self.try_publish(queue, event).await {
            Ok(()) => {
                debug!(queue = %queue, "Event published");
                Ok(())
            }
            Err(MessagingError::ChannelNotReady) if self.mode == PublishMode::BestEffort => {
                warn!(queue = %queue, "Broker channel not initialised, event dropped");
                Ok(())
            }
            Err(e) if self.mode == PublishMode::BestEffort => {
                error!(queue = %queue, error = %e, "Failed to publish event, event dropped");
                Ok(())
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }

    async fn try_publish(&self, queue: &str, event: &Event) -> Result<()> {
        let channel = self
            .connections
            .publish_channel()
            .await
            .ok_or(MessagingError::ChannelNotReady)?;

        let payload = event.to_bytes()?;
        channel.declare_durable_queue(queue).await?;
        channel.publish_persistent(queue, &payload).await
    }
}
