//! Idempotent event consumption.
//!
//! Each subscription runs an explicit receive loop. The broker's delivery
//! stream feeds a bounded queue sized to the prefetch count; the loop takes one
//! delivery at a time and settles it before taking the next:
//!
//! ```text
//! received -> decoded -> duplicate                   -> acked
//!                     -> novel -> handled -> marked  -> acked
//!          -> decode error | handler error           -> nacked (dropped)
//! ```
//!
//! A key is marked only after the handler succeeded and always before the ack
//! is sent. Rejected deliveries are not requeued and there is no dead-letter
//! routing, so a failing handler loses the event.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, Delivery};
use super::connection::ConnectionManager;
use super::error::{MessagingError, Result};
use super::idempotency::IdempotencyTracker;
use crate::types::{Event, MessagingConfig};
use crate::DEFAULT_CONSUMER_PREFETCH;

/// Upper bound on requeueing buffered deliveries at shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Processing callback invoked once per novel event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str;
}

/// [`EventHandler`] backed by a closure.
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler ran and the delivery was acked
    Handled,
    /// Key already processed; acked without running the handler
    Duplicate,
    /// Payload was not a valid event; nacked without requeue
    Malformed,
    /// Handler returned an error; nacked without requeue
    HandlerFailed,
}

/// Counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub handled: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub handler_failures: u64,
    /// Deliveries buffered at shutdown and handed back to the broker
    pub requeued_on_shutdown: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Handled => self.handled += 1,
            DeliveryOutcome::Duplicate => self.duplicates += 1,
            DeliveryOutcome::Malformed => self.malformed += 1,
            DeliveryOutcome::HandlerFailed => self.handler_failures += 1,
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries the broker may push ahead (0 = unlimited)
    pub prefetch: u16,
    /// Prefix of the broker-visible consumer tag
    pub tag_prefix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_CONSUMER_PREFETCH,
            tag_prefix: "group-messaging".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            prefetch: config.consumer_prefetch,
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    fn buffer_size(&self) -> usize {
        match self.prefetch {
            0 => 64,
            n => usize::from(n),
        }
    }
}

/// Cheap, cloneable view of a running subscription.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    queue: String,
    consumer_tag: String,
    running: Arc<AtomicBool>,
}

impl ConsumerStatus {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// False once the receive loop has exited, for any reason.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Clears the running flag when the receive loop task ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Running subscription.
pub struct ConsumerHandle {
    status: ConsumerStatus,
    task: JoinHandle<Result<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// Wait for the receive loop to stop.
    pub async fn join(self) -> Result<ConsumerStats> {
        self.task
            .await
            .map_err(|e| MessagingError::Channel(format!("consumer task failed: {e}")))?
    }
}

/// Subscribes handlers to queues.
pub struct Consumer {
    connections: Arc<ConnectionManager>,
    tracker: Arc<dyn IdempotencyTracker>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tracker: Arc<dyn IdempotencyTracker>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connections,
            tracker,
            config,
        }
    }

    /// Start consuming `queue` with `handler`.
    ///
    /// Declares the queue, sets prefetch and subscribes in manual-ack mode
    /// before returning; failures there are returned. The receive loop then
    /// runs in the background until `shutdown` turns `true` (or its sender is
    /// dropped) or the broker ends the subscription.
    pub async fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerHandle> {
        let channel = self
            .connections
            .consume_channel()
            .await
            .ok_or(MessagingError::ChannelNotReady)?;

        channel.declare_durable_queue(queue).await?;
        channel.set_prefetch(self.config.prefetch).await?;

        let consumer_tag = format!("{}-{}", self.config.tag_prefix, Uuid::new_v4());
        let mut stream = channel.consume(queue, &consumer_tag).await?;

        let (sender, receiver) = mpsc::channel(self.config.buffer_size());
        let feeder = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                if sender.send(item).await.is_err() {
                    break;
                }
            }
        });

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            handler = handler.name(),
            prefetch = self.config.prefetch,
            "Started consuming"
        );

        let receive_loop = ReceiveLoop {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            channel,
            tracker: Arc::clone(&self.tracker),
            handler,
            deliveries: receiver,
            feeder,
        };

        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(Arc::clone(&running));
        let task = tokio::spawn(async move {
            let _guard = guard;
            receive_loop.run(shutdown).await
        });

        Ok(ConsumerHandle {
            status: ConsumerStatus {
                queue: queue.to_string(),
                consumer_tag,
                running,
            },
            task,
        })
    }
}

struct ReceiveLoop {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    tracker: Arc<dyn IdempotencyTracker>,
    handler: Arc<dyn EventHandler>,
    deliveries: mpsc::Receiver<Result<Delivery>>,
    feeder: JoinHandle<()>,
}

impl ReceiveLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let mut stopping = *shutdown.borrow();

        while !stopping {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }

                next = self.deliveries.recv() => match next {
                    Some(Ok(delivery)) => {
                        let outcome = process_delivery(
                            self.channel.as_ref(),
                            self.tracker.as_ref(),
                            self.handler.as_ref(),
                            delivery,
                        )
                        .await;

                        match outcome {
                            Ok(outcome) => stats.record(outcome),
                            Err(e) => {
                                error!(queue = %self.queue, error = %e, "Failed to settle delivery, stopping consumer");
                                self.feeder.abort();
                                return Err(e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "Consumer error");
                    }
                    None => {
                        warn!(queue = %self.queue, "Delivery stream closed by broker");
                        self.feeder.abort();
                        return Ok(stats);
                    }
                },
            }
        }

        stats.requeued_on_shutdown = self.stop().await;

        info!(
            queue = %self.queue,
            handled = stats.handled,
            duplicates = stats.duplicates,
            rejected = stats.malformed + stats.handler_failures,
            requeued = stats.requeued_on_shutdown,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Cancel the subscription and hand every undelivered message back to the broker.
    ///
    /// Once cancelled the broker stream is finite, so the drain runs until the
    /// feeder has forwarded the last delivery and dropped its sender.
    async fn stop(&mut self) -> u64 {
        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(queue = %self.queue, error = %e, "Failed to cancel subscription");
        }

        let mut requeued = 0;
        let drain = async {
            while let Some(item) = self.deliveries.recv().await {
                let Ok(delivery) = item else { continue };
                match self.channel.nack(delivery.delivery_tag, true).await {
                    Ok(()) => requeued += 1,
                    Err(e) => warn!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to requeue buffered delivery"),
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                queue = %self.queue,
                requeued,
                "Delivery stream did not end after cancel, leaving the rest to channel close"
            );
            self.feeder.abort();
        }
        requeued
    }
}

/// Settle one delivery. Errors are channel failures while acking or nacking.
#[instrument(skip_all, fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered))]
async fn process_delivery(
    channel: &dyn BrokerChannel,
    tracker: &dyn IdempotencyTracker,
    handler: &dyn EventHandler,
    delivery: Delivery,
) -> Result<DeliveryOutcome> {
    let tag = delivery.delivery_tag;

    let event = match Event::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "Dropping malformed delivery");
            channel.nack(tag, false).await?;
            return Ok(DeliveryOutcome::Malformed);
        }
    };

    let key = event.idempotency_key();
    match key.as_deref() {
        Some(key) if tracker.has_processed(key) => {
            info!(key = %key, "Event already processed, skipping");
            channel.ack(tag).await?;
            return Ok(DeliveryOutcome::Duplicate);
        }
        Some(_) => {}
        None => warn!("Event has neither uniqueMessageId nor id, cannot deduplicate"),
    }

    if let Err(e) = handler.handle(&event).await {
        let err = MessagingError::Handler {
            handler: handler.name(),
            reason: format!("{e:#}"),
        };
        error!(key = ?key, error = %err, "Dropping event after handler failure");
        channel.nack(tag, false).await?;
        return Ok(DeliveryOutcome::HandlerFailed);
    }

    if let Some(key) = key.as_deref() {
        tracker.mark_processed(key);
    }
    channel.ack(tag).await?;
    debug!(key = ?key, "Event handled");
    Ok(DeliveryOutcome::Handled)
}
