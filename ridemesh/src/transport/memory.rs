//! In-process broker with fault injection.
//!
//! Behaves like a single AMQP node reachable through the default exchange:
//! queues are FIFO, each message goes to one consumer, redeclaring a queue
//! with the same arguments is a no-op and with different arguments closes the
//! channel. [`MemoryBroker::kill`] simulates a broker restart (every connection
//! drops, non-durable queues and transient messages are lost) and
//! [`MemoryBroker::restore`] makes it reachable again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, CloseNotifier, CloseReason, CloseSignal, Connector,
    DeliveryStream,
};
use crate::error::{RideMeshError, Result};
use crate::message::{Delivery, Message};
use crate::topology::{ExchangeSpec, QueueSpec};

struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    persistent: bool,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

struct BrokerState {
    reachable: bool,
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, ExchangeSpec>,
    connections: Vec<Weak<MemoryConnection>>,
    failing_publishes: u32,
    failing_channel_opens: u32,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicU64,
    publish_attempts: AtomicU64,
    consume_attempts: AtomicU64,
    published: AtomicU64,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated broker; cloning shares the same broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    reachable: true,
                    queues: HashMap::new(),
                    exchanges: HashMap::new(),
                    connections: Vec::new(),
                    failing_publishes: 0,
                    failing_channel_opens: 0,
                }),
                connect_attempts: AtomicU64::new(0),
                publish_attempts: AtomicU64::new(0),
                consume_attempts: AtomicU64::new(0),
                published: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Restart the broker and keep it down until [`restore`](Self::restore).
    pub fn kill(&self) {
        let connections = {
            let mut state = self.inner.lock();
            state.reachable = false;
            state.queues.retain(|_, queue| queue.spec.durable);
            for queue in state.queues.values_mut() {
                queue.messages.retain(|m| m.persistent);
            }
            std::mem::take(&mut state.connections)
        };

        for connection in connections.iter().filter_map(Weak::upgrade) {
            connection.fail("CONNECTION_FORCED - broker shutdown");
        }
        debug!("Memory broker killed");
    }

    /// Accept connections again
    pub fn restore(&self) {
        self.inner.lock().reachable = true;
        debug!("Memory broker restored");
    }

    /// Close every open channel with an error while keeping connections alive
    pub fn break_channels(&self) {
        for connection in self.live_connections() {
            for channel in connection.open_channels() {
                channel.notifier.fire(CloseReason::Error(
                    "CHANNEL_ERROR - channel closed by broker".to_string(),
                ));
            }
        }
    }

    /// Reject the next `count` publish attempts
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.lock().failing_publishes = count;
    }

    /// Refuse the next `count` channel opens
    pub fn fail_next_channel_opens(&self, count: u32) {
        self.inner.lock().failing_channel_opens = count;
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every call that reached a channel's publish, accepted or not
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Consumer registrations attempted on any channel
    pub fn consume_attempts(&self) -> u64 {
        self.inner.consume_attempts.load(Ordering::SeqCst)
    }

    /// Messages the broker accepted
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.live_connections().len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue`, or None if it does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Payloads waiting in `queue`, oldest first, without consuming them
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut state = self.inner.lock();
        state.connections.retain(|c| c.strong_count() > 0);
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .collect()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connect_attempts", &self.connect_attempts())
            .field("published", &self.published())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !uri.starts_with("amqp://") && !uri.starts_with("amqps://") {
            return Err(RideMeshError::config_error(format!("unsupported URI: {uri}")));
        }

        let mut state = self.inner.lock();
        if !state.reachable {
            return Err(RideMeshError::broker_error("connection refused"));
        }

        let connection = Arc::new(MemoryConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            broker: self.inner.clone(),
            notifier: CloseNotifier::new(),
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::downgrade(&connection));
        debug!(connection = connection.id, "Memory broker accepted connection");
        Ok(connection)
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
    notifier: CloseNotifier,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    fn open_channels(&self) -> Vec<Arc<MemoryChannel>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|c| !c.notifier.has_fired());
        channels.clone()
    }

    fn fail(&self, reason: &str) {
        self.notifier.fire(CloseReason::Error(reason.to_string()));
        for channel in self.open_channels() {
            channel.notifier.fire(CloseReason::Error(reason.to_string()));
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(RideMeshError::broker_error("connection is closed"));
        }
        {
            let mut state = self.broker.lock();
            if state.failing_channel_opens > 0 {
                state.failing_channel_opens -= 1;
                return Err(RideMeshError::broker_error("channel open refused"));
            }
        }

        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.notifier.clone(),
            notifier: CloseNotifier::new(),
            next_tag: Arc::new(AtomicU64::new(1)),
        });
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel.clone());
        Ok(channel)
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    fn is_open(&self) -> bool {
        !self.notifier.has_fired()
    }

    async fn close(&self) -> Result<()> {
        self.notifier.fire(CloseReason::Clean);
        for channel in self.open_channels() {
            channel.notifier.fire(CloseReason::Clean);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    connection: CloseNotifier,
    notifier: CloseNotifier,
    next_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RideMeshError::broker_error("channel is closed"))
        }
    }

    /// Channel-level protocol error: the broker closes the channel
    fn channel_error(&self, reason: String) -> RideMeshError {
        self.notifier.fire(CloseReason::Error(reason.clone()));
        RideMeshError::Broker(reason)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(self.channel_error(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(self.channel_error(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        self.broker.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(RideMeshError::broker_error("publish rejected"));
        }

        // The default exchange silently drops messages with no matching queue.
        if let Some(queue) = state.queues.get_mut(&message.routing_key) {
            queue.messages.push_back(StoredMessage {
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                persistent: message.persistent,
            });
            queue.notify.notify_waiters();
        }
        self.broker.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.broker.consume_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        let notify = {
            let state = self.broker.lock();
            match state.queues.get(queue) {
                Some(q) => q.notify.clone(),
                None => {
                    self.notifier.fire(CloseReason::Error(format!(
                        "NOT_FOUND - no queue '{queue}'"
                    )));
                    return Err(RideMeshError::QueueNotFound {
                        queue: queue.to_string(),
                    });
                }
            }
        };
        debug!(queue, consumer_tag, "Memory consumer registered");

        let source = DeliverySource {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            notify,
            signal: self.notifier.subscribe(),
            next_tag: self.next_tag.clone(),
        };

        Ok(stream::unfold(source, |mut source| async move {
            let delivery = source.next_delivery().await?;
            Some((Ok(delivery), source))
        })
        .boxed())
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        // Deliveries leave the queue when handed out.
        self.ensure_open()
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    fn is_open(&self) -> bool {
        !self.notifier.has_fired() && !self.connection.has_fired()
    }

    async fn close(&self) -> Result<()> {
        self.notifier.fire(CloseReason::Clean);
        Ok(())
    }
}

struct DeliverySource {
    broker: Arc<BrokerInner>,
    queue: String,
    notify: Arc<Notify>,
    signal: CloseSignal,
    next_tag: Arc<AtomicU64>,
}

impl DeliverySource {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if self.signal.reason().is_some() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.broker.lock();
                state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(|q| q.messages.pop_front())
            };
            if let Some(message) = popped {
                return Some(Delivery {
                    delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
                    routing_key: message.routing_key,
                    redelivered: false,
                    data: message.payload,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.signal.closed() => return None,
            }
        }
    }
}
