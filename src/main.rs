//! Group Messaging Service - Main Entry Point
//!
//! Connects to the broker, consumes `group_created` events and serves the
//! health and publish endpoints until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use group_messaging::api::handlers::{self, AppState};
use group_messaging::messaging::{
    AmqpConnector, BrokerConnector, ConnectRetry, ConnectionManager, Consumer, ConsumerConfig,
    EventHandler, IdempotencyTracker, InMemoryBroker, InMemoryTracker, Publisher, TrackerConfig,
};
use group_messaging::types::{Event, GroupCreated, MessagingConfig};

/// Logs every newly created group.
struct GroupCreatedLogger;

#[async_trait]
impl EventHandler for GroupCreatedLogger {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let group: GroupCreated = event.decode_as()?;
        info!(
            group_id = group.id,
            name = %group.name,
            curator = %group.curator,
            created_at = %event.created_at,
            "Received new group created message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GroupCreatedLogger"
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "group_messaging=info,tower_http=debug".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    init_tracing();
    let config = MessagingConfig::from_env();

    info!("Starting Group Messaging Service v{}", env!("CARGO_PKG_VERSION"));

    // Connect to the broker; failure aborts startup
    let connector: Arc<dyn BrokerConnector> = if config.in_memory_broker {
        warn!("Using in-memory broker, events will not leave this process");
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpConnector)
    };
    let connections = Arc::new(ConnectionManager::new(connector));
    connections
        .connect_with_retry(
            &config.broker,
            &config.credentials,
            ConnectRetry::from_messaging(&config),
        )
        .await?;

    // Start consuming
    let tracker: Arc<dyn IdempotencyTracker> =
        Arc::new(InMemoryTracker::new(TrackerConfig::from_messaging(&config)));
    let consumer = Consumer::new(
        Arc::clone(&connections),
        Arc::clone(&tracker),
        ConsumerConfig::from_messaging(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = consumer
        .start_consuming(
            &config.group_created_queue,
            Arc::new(GroupCreatedLogger),
            shutdown_rx.clone(),
        )
        .await?;
    let consumer_status = consumer_handle.status();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Build HTTP routes
    let port = config.http_port;
    let state = Arc::new(AppState {
        publisher: Publisher::from_messaging(Arc::clone(&connections), &config),
        connections: Arc::clone(&connections),
        tracker,
        consumer: Some(consumer_status.clone()),
        config,
    });
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/events/group-created", post(handlers::publish_group_created))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    // Drain the consumer, then release the broker
    match consumer_handle.join().await {
        Ok(stats) => info!(
            queue = consumer_status.queue(),
            consumer_tag = consumer_status.consumer_tag(),
            handled = stats.handled,
            duplicates = stats.duplicates,
            requeued = stats.requeued_on_shutdown,
            "Consumer drained"
        ),
        Err(e) => error!(queue = consumer_status.queue(), error = %e, "Consumer ended with error"),
    }
    connections.close().await;

    Ok(())
}
