//! Broker connection lifecycle.
//!
//! One connection per process, with one channel for publishing and one for
//! consuming. Both channels are wrapped in [`SerializedChannel`].

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::backoff::ConnectRetry;
use super::broker::{BrokerChannel, BrokerChannels, BrokerConnection, BrokerConnector, SerializedChannel};
use super::error::{MessagingError, Result};
use crate::types::{BrokerAddress, Credentials};

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channels: BrokerChannels,
}

/// Owns the broker connection and the channels derived from it.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    session: RwLock<Option<Session>>,
}

impl ConnectionManager {
    /// Create an unconnected manager.
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            session: RwLock::new(None),
        }
    }

    /// Connect to the broker and open the publish and consume channels.
    ///
    /// Any failure is a [`MessagingError::Connection`]; callers at bootstrap
    /// should abort startup on it. Connecting again replaces and closes the
    /// previous session.
    pub async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<BrokerChannels> {
        let connection = self.connector.connect(address, credentials).await?;

        let channels = match Self::open_channels(connection.as_ref()).await {
            Ok(channels) => channels,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close half-open connection");
                }
                return Err(MessagingError::Connection {
                    address: address.display(),
                    reason: e.to_string(),
                });
            }
        };

        let previous = self.session.write().await.replace(Session {
            connection,
            channels: channels.clone(),
        });
        if let Some(previous) = previous {
            warn!("Replacing existing broker session");
            Self::close_session(previous).await;
        }

        info!(broker = %address.display(), "Broker channels ready");
        Ok(channels)
    }

    /// Like [`connect`](Self::connect), retrying with backoff up to
    /// `retry.max_attempts` times. Returns the last error when all attempts fail.
    pub async fn connect_with_retry(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
        retry: ConnectRetry,
    ) -> Result<BrokerChannels> {
        let mut backoff = retry.backoff();
        let mut attempt = 1;

        loop {
            match self.connect(address, credentials).await {
                Ok(channels) => return Ok(channels),
                Err(e) if attempt < retry.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        error = %e,
                        "Broker connect failed. Retry in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Broker connect failed");
                    return Err(e);
                }
            }
        }
    }

    async fn open_channels(connection: &dyn BrokerConnection) -> Result<BrokerChannels> {
        let publish = connection.open_channel().await?;
        let consume = connection.open_channel().await?;

        Ok(BrokerChannels {
            publish: Arc::new(SerializedChannel::new(publish)),
            consume: Arc::new(SerializedChannel::new(consume)),
        })
    }

    async fn close_session(session: Session) {
        for channel in [session.channels.consume, session.channels.publish] {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close broker channel");
            }
        }
        if let Err(e) = session.connection.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Channel used by the publisher, if connected.
    pub async fn publish_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.channels.publish))
    }

    /// Channel used by consumers, if connected.
    pub async fn consume_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.channels.consume))
    }

    /// Close both channels and the connection. Safe to call more than once.
    pub async fn close(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            Self::close_session(session).await;
            info!("Broker connection closed");
        }
    }
}
