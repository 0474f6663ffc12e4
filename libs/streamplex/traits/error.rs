use thiserror::Error;

/// Main error type for streamplex
#[derive(Error, Debug)]
pub enum StreamError {
    /// Connect, read or write failure on the byte stream
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS or WebSocket upgrade failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Peer broke the framing rules
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Reconnection gave up for a subscription
    #[error("Reconnection failed after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: usize, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Raw I/O error from the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the reconnect supervisor should try again after this error.
    ///
    /// Handshake failures are treated exactly like transport failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(_)
                | StreamError::Handshake(_)
                | StreamError::Timeout(_)
                | StreamError::Io(_)
        )
    }
}

/// Result type for streamplex operations
pub type Result<T> = std::result::Result<T, StreamError>;
