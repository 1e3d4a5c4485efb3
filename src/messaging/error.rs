//! Error taxonomy for the messaging layer.

use thiserror::Error;

/// Errors raised while talking to the broker or processing deliveries.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Broker unreachable or login refused. Fatal at bootstrap.
    #[error("failed to connect to broker at {address}: {reason}")]
    Connection { address: String, reason: String },

    /// Publish or consume attempted before `connect` succeeded.
    #[error("broker channel is not established")]
    ChannelNotReady,

    /// Delivery payload is not a valid event.
    #[error("malformed event payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// Event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// The processing callback returned an error.
    #[error("handler `{handler}` failed: {reason}")]
    Handler { handler: &'static str, reason: String },

    /// A channel operation (declare, publish, ack, ...) failed.
    #[error("broker channel error: {0}")]
    Channel(String),
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        MessagingError::Channel(err.to_string())
    }
}

/// Result alias for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
