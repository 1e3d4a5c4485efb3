//! Broker seam.
//!
//! The rest of the crate talks to the broker only through these traits, so
//! the AMQP client and the in-memory broker are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::Mutex;

use super::error::Result;
use crate::types::{BrokerAddress, Credentials};

/// A message handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery
    pub delivery_tag: u64,
    /// Raw message body
    pub data: Vec<u8>,
    /// Broker has delivered this message before
    pub redelivered: bool,
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live transport connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Operations issued over one logical channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Repeating the call is harmless.
    async fn declare_durable_queue(&self, queue: &str) -> Result<()>;

    /// Send `payload` to `queue` through the default exchange, marked persistent.
    ///
    /// Returns once the frame is handed to the client, not when the broker
    /// confirms it.
    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Subscribe to `queue` in manual-acknowledgement mode.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stop a subscription started by `consume`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Channel wrapper that serializes every operation behind one lock.
///
/// Publishes from request handlers and acks from consumer loops may target the
/// same channel from different tasks; the lock keeps their frames from
/// interleaving.
pub struct SerializedChannel {
    inner: Arc<dyn BrokerChannel>,
    lock: Mutex<()>,
}

impl SerializedChannel {
    pub fn new(inner: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for SerializedChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.declare_durable_queue(queue).await
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.publish_persistent(queue, payload).await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.set_prefetch(count).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let _guard = self.lock.lock().await;
        self.inner.consume(queue, consumer_tag).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.cancel(consumer_tag).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.nack(delivery_tag, requeue).await
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.close().await
    }
}

/// The channels derived from one connection: one per direction.
#[derive(Clone)]
pub struct BrokerChannels {
    pub publish: Arc<dyn BrokerChannel>,
    pub consume: Arc<dyn BrokerChannel>,
}
