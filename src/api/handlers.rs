//! HTTP request handlers for the messaging service.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::{error, info};

use crate::messaging::{
    ConnectionManager, ConsumerStatus, IdempotencyTracker, MessagingError, Publisher,
};
use crate::types::{GroupCreated, MessagingConfig};

/// Application state shared across handlers.
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub publisher: Publisher,
    pub tracker: Arc<dyn IdempotencyTracker>,
    /// Subscription on the group-created queue, once started
    pub consumer: Option<ConsumerStatus>,
    pub config: MessagingConfig,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    broker: String,
    broker_connected: bool,
    queue: String,
    consumer_running: bool,
    processed_keys: usize,
}

/// Health check endpoint.
///
/// Reports 503 while the broker is not connected or the consumer loop has
/// stopped.
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.connections.is_connected().await;
    let consumer_running = state.consumer.as_ref().is_some_and(ConsumerStatus::is_running);
    let healthy = connected && consumer_running;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broker: state.config.broker.display(),
            broker_connected: connected,
            queue: state.config.group_created_queue.clone(),
            consumer_running,
            processed_keys: state.tracker.len(),
        }),
    )
}

/// Publish group event response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    queue: String,
    unique_message_id: Option<String>,
}

/// Announce a newly created group on the group-created queue.
pub async fn publish_group_created(
    State(state): State<Arc<AppState>>,
    Json(group): Json<GroupCreated>,
) -> Result<(StatusCode, Json<PublishResponse>), StatusCode> {
    let queue = &state.config.group_created_queue;
    let event = group.to_event();

    match state.publisher.publish(queue, &event).await {
        Ok(()) => {
            info!(group_id = group.id, queue = %queue, "Group created event accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(PublishResponse {
                    queue: queue.clone(),
                    unique_message_id: event.unique_message_id,
                }),
            ))
        }
        Err(MessagingError::ChannelNotReady) => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(e) => {
            error!(group_id = group.id, error = %e, "Group created event rejected");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Consumer, ConsumerConfig, InMemoryBroker, InMemoryTracker};
    use crate::types::{BrokerAddress, Credentials, Event};
    use axum::{
        body::Body,
        http::{header, Request},
        routing::{get, post},
        Router,
    };
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/events/group-created", post(publish_group_created))
            .with_state(state)
    }

    fn state(broker: &InMemoryBroker, config: MessagingConfig) -> AppState {
        let connections = Arc::new(ConnectionManager::new(Arc::new(broker.clone())));
        AppState {
            publisher: Publisher::from_messaging(Arc::clone(&connections), &config),
            connections,
            tracker: Arc::new(InMemoryTracker::unbounded()),
            consumer: None,
            config,
        }
    }

    async fn connect(state: &AppState) {
        state
            .connections
            .connect(&BrokerAddress::default(), &Credentials::default())
            .await
            .unwrap();
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn publish_request() -> Request<Body> {
        Request::post("/events/group-created")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"id":7,"name":"G","curator":"C"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_degraded_before_connect() {
        let broker = InMemoryBroker::new();
        let response = app(Arc::new(state(&broker, MessagingConfig::default())))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_follows_consumer_loop() {
        let broker = InMemoryBroker::new();
        let mut state = state(&broker, MessagingConfig::default());
        connect(&state).await;
        state.tracker.mark_processed("group_1_0");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Consumer::new(
            Arc::clone(&state.connections),
            Arc::clone(&state.tracker),
            ConsumerConfig::default(),
        )
        .start_consuming(
            "group_created",
            Arc::new(crate::messaging::handler_fn("noop", |_event: Event| async {
                Ok::<_, anyhow::Error>(())
            })),
            shutdown_rx,
        )
        .await
        .unwrap();
        state.consumer = Some(handle.status());
        let state = Arc::new(state);

        let response = app(Arc::clone(&state))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["broker_connected"], true);
        assert_eq!(json["consumer_running"], true);
        assert_eq!(json["processed_keys"], 1);
        assert_eq!(json["queue"], "group_created");

        // Broker still connected, but nothing is consuming any more
        shutdown_tx.send(true).unwrap();
        handle.join().await.unwrap();

        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["broker_connected"], true);
        assert_eq!(json["consumer_running"], false);
    }

    #[tokio::test]
    async fn test_publish_group_created_enqueues_event() {
        let broker = InMemoryBroker::new();
        let state = state(&broker, MessagingConfig::default());
        connect(&state).await;

        let response = app(Arc::new(state)).oneshot(publish_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert!(json["uniqueMessageId"].as_str().unwrap().starts_with("group_7_"));
        assert_eq!(broker.ready_count("group_created"), 1);
    }

    #[tokio::test]
    async fn test_publish_before_connect_depends_on_strict_flag() {
        let broker = InMemoryBroker::new();

        let lenient = app(Arc::new(state(&broker, MessagingConfig::default())))
            .oneshot(publish_request())
            .await
            .unwrap();
        assert_eq!(lenient.status(), StatusCode::ACCEPTED);

        let strict_config = MessagingConfig {
            publish_strict: true,
            ..MessagingConfig::default()
        };
        let strict = app(Arc::new(state(&broker, strict_config)))
            .oneshot(publish_request())
            .await
            .unwrap();
        assert_eq!(strict.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(broker.published_count("group_created"), 0);
    }
}
