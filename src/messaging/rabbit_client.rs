//! RabbitMQ client for the groups service
//!
//! AMQP 0-9-1 implementation of the broker traits on top of `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream};
use super::error::{MessagingError, Result};
use crate::types::{BrokerAddress, Credentials};

const REPLY_SUCCESS: u16 = 200;

/// Connects to a real RabbitMQ broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    /// Connection properties running lapin's I/O on the current tokio runtime.
    pub fn connection_properties() -> ConnectionProperties {
        ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let uri = address.amqp_uri(credentials);

        let connection = Connection::connect(&uri, Self::connection_properties())
            .await
            .map_err(|e| MessagingError::Connection {
                address: address.display(),
                reason: e.to_string(),
            })?;

        info!(broker = %address.display(), user = %credentials.username, "RabbitMQ connection established");

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

/// One TCP connection to the broker.
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "RabbitMQ channel opened");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        }
        Ok(())
    }
}

/// One AMQP channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    /// Properties stamped on every published event.
    pub fn persistent_properties() -> BasicProperties {
        BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()> {
        // The publisher confirm is deliberately not awaited.
        let _confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                Self::persistent_properties(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Delivery {
                    delivery_tag: d.delivery_tag,
                    redelivered: d.redelivered,
                    data: d.data,
                })
                .map_err(MessagingError::from)
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "shutdown").await?;
        }
        Ok(())
    }
}
