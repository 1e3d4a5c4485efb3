//! End-to-end publish/consume scenarios against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::watch;

use group_messaging::messaging::{
    handler_fn, ConnectionManager, Consumer, ConsumerConfig, ConsumerHandle, EventHandler,
    IdempotencyTracker, InMemoryBroker, InMemoryTracker, Publisher, Rejection,
};
use group_messaging::types::{BrokerAddress, Credentials, Event, GroupCreated};
use group_messaging::GROUP_CREATED_QUEUE;

const WAIT: Duration = Duration::from_secs(5);

struct Service {
    broker: InMemoryBroker,
    connections: Arc<ConnectionManager>,
    publisher: Publisher,
    tracker: Arc<InMemoryTracker>,
    shutdown: watch::Sender<bool>,
}

impl Service {
    fn new() -> Self {
        let broker = InMemoryBroker::new();
        let connections = Arc::new(ConnectionManager::new(Arc::new(broker.clone())));
        let (shutdown, _) = watch::channel(false);
        Self {
            publisher: Publisher::new(Arc::clone(&connections)),
            broker,
            connections,
            tracker: Arc::new(InMemoryTracker::unbounded()),
            shutdown,
        }
    }

    async fn connect(&self) {
        self.connections
            .connect(&BrokerAddress::default(), &Credentials::default())
            .await
            .expect("in-memory broker accepts connections");
    }

    async fn consume(&self, handler: Arc<dyn EventHandler>) -> ConsumerHandle {
        let tracker: Arc<dyn IdempotencyTracker> = self.tracker.clone();
        Consumer::new(Arc::clone(&self.connections), tracker, ConsumerConfig::default())
            .start_consuming(GROUP_CREATED_QUEUE, handler, self.shutdown.subscribe())
            .await
            .expect("consumer starts")
    }

    async fn settled(&self, count: usize) -> bool {
        self.broker
            .wait_until(WAIT, |b| {
                b.acked(GROUP_CREATED_QUEUE).len() + b.rejections(GROUP_CREATED_QUEUE).len() >= count
            })
            .await
    }
}

/// Records every event it is given.
fn recording_handler() -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler_fn("recorder", move |event: Event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok::<_, anyhow::Error>(())
        }
    });
    (Arc::new(handler), seen)
}

fn sample_event() -> Event {
    Event::from_slice(
        json!({
            "uniqueMessageId": "group_7_1690000000000",
            "id": 7,
            "name": "G",
            "curator": "C",
            "createdAt": "2025-01-01T00:00:00Z",
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap()
}

#[tokio::test]
async fn round_trip_event_is_handled_once_and_acked() {
    let service = Service::new();
    service.connect().await;
    let (handler, seen) = recording_handler();
    let _consumer = service.consume(handler).await;

    let event = sample_event();
    service.publisher.publish(GROUP_CREATED_QUEUE, &event).await.unwrap();

    assert!(service.settled(1).await);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![event]);
    assert_eq!(seen[0].created_at, "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    assert_eq!(service.broker.acked(GROUP_CREATED_QUEUE).len(), 1);
    assert!(service.broker.rejections(GROUP_CREATED_QUEUE).is_empty());
    assert!(service.tracker.has_processed("group_7_1690000000000"));
}

#[tokio::test]
async fn same_event_published_twice_before_start_is_handled_once() {
    let service = Service::new();
    service.connect().await;

    let event = GroupCreated {
        id: 12,
        name: "Algebra".to_string(),
        curator: "Petrenko".to_string(),
    }
    .to_event();
    service.publisher.publish(GROUP_CREATED_QUEUE, &event).await.unwrap();
    service.publisher.publish(GROUP_CREATED_QUEUE, &event).await.unwrap();
    assert_eq!(service.broker.ready_count(GROUP_CREATED_QUEUE), 2);

    let (handler, seen) = recording_handler();
    let _consumer = service.consume(handler).await;

    assert!(service.settled(2).await);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(service.broker.acked(GROUP_CREATED_QUEUE).len(), 2);
    assert_eq!(service.broker.ready_count(GROUP_CREATED_QUEUE), 0);
}

#[tokio::test]
async fn malformed_payload_is_nacked_without_requeue() {
    let service = Service::new();
    service.connect().await;
    let (handler, seen) = recording_handler();
    let _consumer = service.consume(handler).await;

    service.broker.inject(GROUP_CREATED_QUEUE, b"{\"id\": 7, \"name\": ".to_vec());

    assert!(service.settled(1).await);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(
        service.broker.rejections(GROUP_CREATED_QUEUE),
        vec![Rejection {
            data: b"{\"id\": 7, \"name\": ".to_vec(),
            requeue: false,
        }]
    );
    assert_eq!(service.broker.ready_count(GROUP_CREATED_QUEUE), 0);
}

#[tokio::test]
async fn publish_before_connect_enqueues_nothing() {
    let service = Service::new();

    let result = service.publisher.publish(GROUP_CREATED_QUEUE, &sample_event()).await;

    assert!(result.is_ok());
    assert_eq!(service.broker.published_count(GROUP_CREATED_QUEUE), 0);

    // Nothing shows up once a consumer does attach
    service.connect().await;
    let (handler, seen) = recording_handler();
    let _consumer = service.consume(handler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failing_handler_drops_event_and_allows_later_copy() {
    let service = Service::new();
    service.connect().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = handler_fn("flaky", move |_event: Event| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    });
    let _consumer = service.consume(Arc::new(handler)).await;

    let event = sample_event();
    service.publisher.publish(GROUP_CREATED_QUEUE, &event).await.unwrap();
    assert!(service.settled(1).await);
    assert_eq!(service.broker.rejections(GROUP_CREATED_QUEUE).len(), 1);
    assert!(!service.tracker.has_processed("group_7_1690000000000"));

    // A fresh copy of the same event is handled since the first never completed
    service.publisher.publish(GROUP_CREATED_QUEUE, &event).await.unwrap();
    assert!(service.settled(2).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(service.broker.acked(GROUP_CREATED_QUEUE).len(), 1);
    assert!(service.tracker.has_processed("group_7_1690000000000"));
}

#[tokio::test]
async fn shutdown_stops_consumer_and_close_releases_broker() {
    let service = Service::new();
    service.connect().await;
    let (handler, seen) = recording_handler();
    let consumer = service.consume(handler).await;

    service.publisher.publish(GROUP_CREATED_QUEUE, &sample_event()).await.unwrap();
    assert!(service.settled(1).await);

    service.shutdown.send(true).unwrap();
    let stats = consumer.join().await.unwrap();
    assert_eq!(stats.handled, 1);
    assert!(!service.broker.has_consumer(GROUP_CREATED_QUEUE));

    // Published after shutdown: stays queued for the next process
    service.publisher.publish(GROUP_CREATED_QUEUE, &sample_event()).await.unwrap();
    assert_eq!(service.broker.ready_count(GROUP_CREATED_QUEUE), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);

    service.connections.close().await;
    assert_eq!(service.broker.connection_count(), 0);
    assert_eq!(service.broker.open_channel_count(), 0);
}
