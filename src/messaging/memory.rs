//! In-memory broker.
//!
//! Implements the broker traits with RabbitMQ's queue semantics: durable
//! declaration, default-exchange routing by queue name, manual ack, per-consumer
//! prefetch, and requeue of unacknowledged deliveries when a channel closes.
//! Used by the test suites and for running the service without RabbitMQ.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use super::broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream};
use super::error::{MessagingError, Result};
use crate::types::{BrokerAddress, Credentials};

/// A nack observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub data: Vec<u8>,
    pub requeue: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel_id: u64,
    consumer_tag: String,
    message: StoredMessage,
}

struct Subscription {
    channel_id: u64,
    consumer_tag: String,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    subscription: Option<Subscription>,
    published: usize,
    acked: Vec<Vec<u8>>,
    rejections: Vec<Rejection>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    tag_index: HashMap<u64, String>,
    channel_prefetch: HashMap<u64, u16>,
    open_channels: HashSet<u64>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    connections: usize,
    unreachable: bool,
    required_credentials: Option<Credentials>,
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u64) -> Result<()> {
        if self.open_channels.contains(&channel_id) {
            Ok(())
        } else {
            Err(MessagingError::Channel(format!("channel {channel_id} is closed")))
        }
    }

    /// Push ready messages to the queue's consumer while prefetch allows.
    fn dispatch(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        loop {
            let Some(sub) = state.subscription.as_ref() else {
                return;
            };
            let in_flight = state
                .unacked
                .values()
                .filter(|u| u.consumer_tag == sub.consumer_tag)
                .count();
            if sub.prefetch != 0 && in_flight >= usize::from(sub.prefetch) {
                return;
            }
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                data: message.data.clone(),
                redelivered: message.redelivered,
            };

            if sub.sender.unbounded_send(Ok(delivery)).is_err() {
                // Consumer went away without cancelling
                state.ready.push_front(message);
                state.subscription = None;
                return;
            }

            state.unacked.insert(
                tag,
                Unacked {
                    channel_id: sub.channel_id,
                    consumer_tag: sub.consumer_tag.clone(),
                    message,
                },
            );
            self.tag_index.insert(tag, queue.to_string());
        }
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> Result<(String, StoredMessage)> {
        self.ensure_open(channel_id)?;

        let unknown = || MessagingError::Channel(format!("unknown delivery tag {delivery_tag}"));
        let queue = self.tag_index.get(&delivery_tag).cloned().ok_or_else(unknown)?;
        let state = self.queues.get_mut(&queue).ok_or_else(unknown)?;

        match state.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel_id == channel_id => {}
            _ => return Err(unknown()),
        }

        let entry = state.unacked.remove(&delivery_tag).ok_or_else(unknown)?;
        self.tag_index.remove(&delivery_tag);
        Ok((queue, entry.message))
    }

    fn close_channel(&mut self, channel_id: u64) {
        if !self.open_channels.remove(&channel_id) {
            return;
        }
        self.channel_prefetch.remove(&channel_id);

        let mut touched = Vec::new();
        for (name, state) in self.queues.iter_mut() {
            if state
                .subscription
                .as_ref()
                .is_some_and(|s| s.channel_id == channel_id)
            {
                state.subscription = None;
            }

            let mut orphaned: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Requeue in original delivery order
            orphaned.sort_unstable_by(|a, b| b.cmp(a));
            for tag in orphaned {
                if let Some(entry) = state.unacked.remove(&tag) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    state.ready.push_front(message);
                    self.tag_index.remove(&tag);
                }
            }
            touched.push(name.clone());
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

/// Shared in-memory broker. Clones observe the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent connect fail as if the host were down.
    pub fn refuse_connections(&self) {
        self.lock().unreachable = true;
    }

    /// Accept connections again.
    pub fn accept_connections(&self) {
        self.lock().unreachable = false;
    }

    /// Reject logins that do not match `credentials`.
    pub fn require_credentials(&self, credentials: Credentials) {
        self.lock().required_credentials = Some(credentials);
    }

    /// Enqueue raw bytes as if a foreign producer had published them.
    pub fn inject(&self, queue: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.published += 1;
        entry.ready.push_back(StoredMessage {
            data: data.into(),
            redelivered: false,
        });
        state.dispatch(queue);
    }

    /// Whether `queue` has been declared durable.
    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Messages routed to `queue` since it was created.
    pub fn published_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.published)
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Bodies of acknowledged deliveries, in ack order.
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.acked.clone())
            .unwrap_or_default()
    }

    /// Nacks received for `queue`, in order.
    pub fn rejections(&self, queue: &str) -> Vec<Rejection> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.rejections.clone())
            .unwrap_or_default()
    }

    /// Whether a consumer is currently subscribed to `queue`.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.subscription.is_some())
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().open_channels.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    /// Poll `predicate` until it holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&InMemoryBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();

        if state.unreachable {
            return Err(MessagingError::Connection {
                address: address.display(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(required) = &state.required_credentials {
            if required != credentials {
                return Err(MessagingError::Connection {
                    address: address.display(),
                    reason: "ACCESS_REFUSED - login was refused".to_string(),
                });
            }
        }

        state.connections += 1;
        drop(state);

        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Channel("connection is closed".to_string()));
        }

        let id = {
            let mut state = self.broker.lock();
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.open_channels.insert(id);
            id
        };
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channels = std::mem::take(&mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner));
        let mut state = self.broker.lock();
        for id in channels {
            state.close_channel(id);
        }
        state.connections = state.connections.saturating_sub(1);
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.durable = true;
        Ok(())
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        // The default exchange silently drops messages for unknown queues.
        let Some(entry) = state.queues.get_mut(queue) else {
            return Ok(());
        };
        entry.published += 1;
        entry.ready.push_back(StoredMessage {
            data: payload.to_vec(),
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        state.channel_prefetch.insert(self.id, count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let prefetch = state.channel_prefetch.get(&self.id).copied().unwrap_or(0);
        let entry = state.queues.get_mut(queue).ok_or_else(|| {
            MessagingError::Channel(format!("NOT_FOUND - no queue '{queue}'"))
        })?;
        if entry.subscription.is_some() {
            return Err(MessagingError::Channel(format!(
                "queue '{queue}' already has a consumer"
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        entry.subscription = Some(Subscription {
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            prefetch,
            sender,
        });
        state.dispatch(queue);

        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        for queue in state.queues.values_mut() {
            if queue
                .subscription
                .as_ref()
                .is_some_and(|s| s.channel_id == self.id && s.consumer_tag == consumer_tag)
            {
                queue.subscription = None;
            }
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        let (queue, message) = state.settle(self.id, delivery_tag)?;

        if let Some(entry) = state.queues.get_mut(&queue) {
            entry.acked.push(message.data);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let (queue, mut message) = state.settle(self.id, delivery_tag)?;

        if let Some(entry) = state.queues.get_mut(&queue) {
            entry.rejections.push(Rejection {
                data: message.data.clone(),
                requeue,
            });
            if requeue {
                message.redelivered = true;
                entry.ready.push_front(message);
            }
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}
