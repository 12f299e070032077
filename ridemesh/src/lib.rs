//! # ridemesh - self-healing RabbitMQ client for the ride-sharing services
//!
//! The trip and driver services talk to each other through RabbitMQ. This
//! crate owns the broker connection and its channel, notices when either goes
//! away, reconnects with exponential backoff and re-declares the queues the
//! services depend on. Callers only see three operations:
//! [`publish`](BrokerClient::publish), [`consume`](BrokerClient::consume) and
//! [`close`](BrokerClient::close).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ridemesh::{BrokerClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BrokerClient::connect(ClientConfig::from_env()?).await?;
//!
//!     let consumer = client.clone();
//!     tokio::spawn(async move {
//!         consumer
//!             .consume("hello", |delivery| async move {
//!                 println!("driver service received: {}", delivery.text());
//!                 Ok(())
//!             })
//!             .await
//!     });
//!
//!     client.publish("hello", r#"{"trip_id":"42"}"#).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod topology;
pub mod transport;

mod channel;
mod connection;
mod state;

pub use backoff::RetryPolicy;
pub use client::{BrokerClient, ClientStats};
pub use config::{ClientConfig, Settings};
pub use error::{RideMeshError, Result};
pub use handler::{FunctionHandler, MessageHandler};
pub use message::{Delivery, Message};
pub use topology::{ExchangeKind, ExchangeSpec, QueueSpec, Topology};
#[cfg(any(test, feature = "test-util"))]
pub use transport::memory::MemoryBroker;
