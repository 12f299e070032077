use serde::Serialize;

use crate::error::Result;

/// Content type stamped on every outbound message; payloads arrive pre-serialized.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Outbound message, built per publish call and dropped once it returns
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Routing key (the queue name when publishing to the default exchange)
    pub routing_key: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Ask the broker to persist the message (delivery mode 2)
    pub persistent: bool,
    /// MIME content type
    pub content_type: &'static str,
}

impl Message {
    /// Create a transient text message
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
            persistent: false,
            content_type: CONTENT_TYPE_TEXT,
        }
    }

    /// Serialize `value` as JSON into the payload
    pub fn json(routing_key: impl Into<String>, value: &impl Serialize) -> Result<Self> {
        Ok(Self::new(routing_key, serde_json::to_vec(value)?))
    }

    /// Set the persistence flag
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// AMQP delivery mode: 2 for persistent, 1 for transient
    pub fn delivery_mode(&self) -> u8 {
        if self.persistent {
            2
        } else {
            1
        }
    }
}

/// A message received from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the delivery
    pub delivery_tag: u64,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Set by the broker when this is a redelivery
    pub redelivered: bool,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl Delivery {
    /// Payload as UTF-8 text, replacing invalid sequences
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Deserialize a JSON payload
    pub fn deserialize_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}
