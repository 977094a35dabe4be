//! Error types for the intake chat client.

/// Top-level error type for the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Push channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Malformed push event: {0}")]
    MalformedEvent(#[from] MalformedEventError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// REST call failures against the session/message service.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Could not decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("Message text is empty")]
    EmptyMessage,
}

impl TransportError {
    /// HTTP status code, if the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Connection-level push channel failures. Recovered by reconnection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Connection closed")]
    Closed,
}

/// An inbound push frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEventError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no string \"type\" field")]
    MissingType,
}

/// Misuse of the synchronization engine lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Chat engine is already initialized")]
    AlreadyInitialized,

    #[error("Chat engine has no active session")]
    NotInitialized,

    #[error("Initialization was cancelled by teardown")]
    Cancelled,
}

/// Result type alias for the client.
pub type Result<T> = std::result::Result<T, Error>;
