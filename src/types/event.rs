//! Domain event envelope and the wire format it travels in.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messaging::MessagingError;

/// A domain event as it travels through the broker.
///
/// On the wire this is a flat JSON object:
/// `{"uniqueMessageId": "...", "id": 7, ...domain fields, "createdAt": "..."}`.
/// Domain fields are kept in `payload` and flattened back on encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Explicit idempotency key supplied by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_message_id: Option<String>,

    /// Primary identifier of the entity the event is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// When the event was emitted
    pub created_at: DateTime<Utc>,

    /// Remaining domain fields
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            unique_message_id: None,
            id: None,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Set the explicit idempotency key.
    pub fn with_unique_id(mut self, key: impl Into<String>) -> Self {
        self.unique_message_id = Some(key.into());
        self
    }

    /// Set the entity identifier.
    pub fn with_entity_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Override the emission timestamp.
    pub fn emitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Key used for deduplication.
    ///
    /// A non-empty `uniqueMessageId` wins; otherwise the entity `id` is used
    /// as `id:<n>`, keeping `"7"` and `7` apart. `None` means the event cannot
    /// be deduplicated.
    pub fn idempotency_key(&self) -> Option<String> {
        self.unique_message_id
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .or_else(|| self.id.map(|id| format!("id:{id}")))
    }

    /// Encode to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(MessagingError::Encode)
    }

    /// Decode from the JSON wire format.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes).map_err(MessagingError::Decode)
    }

    /// Interpret the whole event as a typed domain payload.
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        let value = serde_json::to_value(self).map_err(MessagingError::Encode)?;
        serde_json::from_value(value).map_err(MessagingError::Decode)
    }
}

/// Payload emitted after a group row has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCreated {
    pub id: i64,
    pub name: String,
    pub curator: String,
}

impl GroupCreated {
    /// Build the event for this group, emitted now.
    pub fn to_event(&self) -> Event {
        self.to_event_at(Utc::now())
    }

    /// Build the event for this group with an explicit timestamp.
    ///
    /// The idempotency key is `group_<id>_<unix millis>`.
    pub fn to_event_at(&self, at: DateTime<Utc>) -> Event {
        let mut payload = Map::new();
        payload.insert("name".to_string(), Value::String(self.name.clone()));
        payload.insert("curator".to_string(), Value::String(self.curator.clone()));

        Event::new(payload)
            .with_entity_id(self.id)
            .with_unique_id(format!("group_{}_{}", self.id, at.timestamp_millis()))
            .emitted_at(at)
    }
}
