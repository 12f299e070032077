//! Broker transport abstraction.
//!
//! The supervisors only ever talk to the broker through these traits, so the
//! same recovery logic drives the `lapin` transport in production and the
//! in-process `memory` broker (feature `test-util`) in tests.

pub mod amqp;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

use crate::error::Result;
use crate::message::{Delivery, Message};
use crate::topology::{ExchangeSpec, QueueSpec};

/// Why a connection or channel went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on purpose by this client
    Clean,
    /// Closed by the broker, the network, or a protocol error
    Error(String),
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => f.write_str("closed by client"),
            Self::Error(reason) => f.write_str(reason),
        }
    }
}

/// Firing side of a one-shot close notification.
///
/// Only the first call to [`fire`](Self::fire) has an effect.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record the close reason. Returns false if it had already fired.
    pub fn fire(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn has_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiting side of a one-shot close notification
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    /// Wait until the owning connection or channel closes.
    ///
    /// Returns immediately if it already has. A notifier dropped without
    /// firing counts as an unexpected close.
    pub async fn closed(&mut self) -> CloseReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Clean),
            Err(_) => CloseReason::Error("close notifier dropped".to_string()),
        }
    }

    /// The reason, if the close already happened
    pub fn reason(&self) -> Option<CloseReason> {
        self.rx.borrow().clone()
    }
}

/// Stream of deliveries from one consumer registration
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Dials the broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport-level session to `uri`
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// Transport-level session with the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a multiplexed channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// One-shot notification fired when this connection closes
    fn close_signal(&self) -> CloseSignal;

    fn is_open(&self) -> bool;

    /// Close on purpose; fires [`CloseReason::Clean`]
    async fn close(&self) -> Result<()>;
}

/// Logical session used for declare/publish/consume
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Publish to the default exchange and wait for the broker to take it
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Register a consumer; the stream ends when the channel closes
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// One-shot notification fired when this channel closes
    fn close_signal(&self) -> CloseSignal;

    fn is_open(&self) -> bool;

    /// Close on purpose; fires [`CloseReason::Clean`]
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notifier_fires_once() {
        let notifier = CloseNotifier::new();
        let mut signal = notifier.subscribe();

        assert!(signal.reason().is_none());
        assert!(notifier.fire(CloseReason::Error("connection reset".into())));
        assert!(!notifier.fire(CloseReason::Clean));

        assert_eq!(
            signal.closed().await,
            CloseReason::Error("connection reset".into())
        );
        // Late subscribers still see the first reason.
        let mut late = notifier.subscribe();
        assert_eq!(late.closed().await, CloseReason::Error("connection reset".into()));
    }

    #[tokio::test]
    async fn test_signal_waits_until_fired() {
        let notifier = CloseNotifier::new();
        let mut signal = notifier.subscribe();

        let pending = tokio::time::timeout(Duration::from_millis(20), signal.closed()).await;
        assert!(pending.is_err());

        notifier.fire(CloseReason::Clean);
        assert!(signal.closed().await.is_clean());
        assert!(notifier.has_fired());
    }

    #[tokio::test]
    async fn test_dropped_notifier_counts_as_error() {
        let notifier = CloseNotifier::new();
        let mut signal = notifier.subscribe();
        drop(notifier);
        assert!(!signal.closed().await.is_clean());
    }
}
