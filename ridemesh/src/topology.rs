//! Exchanges and queues the client depends on.
//!
//! The same [`Topology`] is declared on every freshly opened channel, so every
//! declaration must be safe to repeat.

use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::transport::BrokerChannel;

/// Queue the ride-sharing services exchange messages on by default
pub const DEFAULT_QUEUE: &str = "hello";

/// AMQP exchange type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Non-durable, shared, kept while unused
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Survives broker restarts
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable: true,
            ..Self::transient(name)
        }
    }
}

/// Static declaration of everything the client needs on the broker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchanges: Vec::new(),
            queues: vec![QueueSpec::transient(DEFAULT_QUEUE)],
        }
    }
}

impl Topology {
    /// Topology with no exchanges and no queues
    pub fn empty() -> Self {
        Self {
            exchanges: Vec::new(),
            queues: Vec::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchanges.push(exchange);
        self
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    /// Whether messages routed to `queue` should be published as persistent
    pub fn is_durable(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q.name == queue && q.durable)
    }

    /// Declare exchanges, then queues, on `channel`
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, "Declared exchange");
        }
        for queue in &self.queues {
            channel.declare_queue(queue).await?;
            debug!(queue = %queue.name, durable = queue.durable, "Declared queue");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::Connector;

    #[test]
    fn test_default_topology_is_hello_queue() {
        let topology = Topology::default();
        assert!(topology.exchanges.is_empty());
        assert_eq!(topology.queues, vec![QueueSpec::transient("hello")]);
        assert!(!topology.is_durable("hello"));
    }

    #[test]
    fn test_durability_lookup() {
        let topology = Topology::empty()
            .with_queue(QueueSpec::durable("trip.events"))
            .with_queue(QueueSpec::transient("driver.pings"));
        assert!(topology.is_durable("trip.events"));
        assert!(!topology.is_durable("driver.pings"));
        assert!(!topology.is_durable("unknown"));
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://localhost").await.unwrap();
        let topology = Topology::default().with_exchange(ExchangeSpec {
            name: "trips".to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
        });

        let first = connection.create_channel().await.unwrap();
        topology.declare(first.as_ref()).await.unwrap();
        let second = connection.create_channel().await.unwrap();
        topology.declare(second.as_ref()).await.unwrap();
        topology.declare(second.as_ref()).await.unwrap();

        assert_eq!(broker.queue_names(), vec!["hello".to_string()]);
        assert_eq!(broker.exchange_names(), vec!["trips".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_redeclare_fails() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://localhost").await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        Topology::default().declare(channel.as_ref()).await.unwrap();
        let conflicting = Topology::empty().with_queue(QueueSpec::durable("hello"));
        assert!(conflicting.declare(channel.as_ref()).await.is_err());
    }
}
