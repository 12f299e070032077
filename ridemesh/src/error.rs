use thiserror::Error;

/// Result type alias for ridemesh operations
pub type Result<T> = std::result::Result<T, RideMeshError>;

/// Errors surfaced by the broker client
#[derive(Error, Debug)]
pub enum RideMeshError {
    /// AMQP transport errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Payload serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors (bad URI, invalid retry tuning)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No usable channel is installed right now
    #[error("Not connected to the broker")]
    NotConnected,

    /// The client has been closed
    #[error("Client closed")]
    Closed,

    /// A newer connection generation replaced the one this operation was bound to
    #[error("Connection generation {generation} was superseded")]
    Superseded { generation: u64 },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Every retry attempt failed
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<RideMeshError>,
    },

    /// A consume loop for this queue is already running on this client
    #[error("Queue '{queue}' already has an active consumer")]
    AlreadyConsuming { queue: String },

    /// The broker has no queue by this name
    #[error("Queue '{queue}' does not exist")]
    QueueNotFound { queue: String },

    /// Broker-side failure reported by a transport
    #[error("Broker error: {0}")]
    Broker(String),

    /// Consumer handler errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RideMeshError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    /// Check if error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::NotConnected => true,
            Self::Broker(_) => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// True when the error means the client is shutting down
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::RetriesExhausted { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}
