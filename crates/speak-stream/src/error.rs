//! Error types for the streaming playback pipeline.

/// Result type alias for speak-stream operations
pub type SpeakResult<T> = Result<T, SpeakError>;

/// Main error type for streaming playback operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeakError {
    /// Malformed framing on the wire
    #[error("Protocol error: {message}")]
    ProtocolError {
        /// Description of the framing violation
        message: String,
    },

    /// The channel closed before the stream ended gracefully
    #[error("Connection closed: {message}")]
    ConnectionClosed {
        /// What was pending when the channel closed
        message: String,
    },

    /// The synthesis process reported a failure mid-stream
    #[error("Generation failed: {message}")]
    GenerationError {
        /// Error text sent by the synthesis process
        message: String,
    },

    /// The audio output device failed
    #[error("Audio sink error: {message}")]
    SinkError {
        /// Error message describing the device issue
        message: String,
    },

    /// The session was cancelled by the user
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Reason given to `cancel`
        reason: String,
    },

    /// Could not open or write to the channel
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Error message describing the connection failure
        message: String,
    },

    /// Invalid input error
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Error message describing the invalid input
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Task or thread coordination failed
    #[error("Concurrency error: {message}")]
    ConcurrencyError {
        /// Error message describing the concurrency issue
        message: String,
    },
}

impl SpeakError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create a new connection-closed error
    #[must_use]
    pub fn connection_closed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a new generation error
    #[must_use]
    pub fn generation<S: Into<String>>(message: S) -> Self {
        Self::GenerationError {
            message: message.into(),
        }
    }

    /// Create a new audio sink error
    #[must_use]
    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::SinkError {
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    #[must_use]
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a new connection error
    #[must_use]
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Create a new invalid input error
    #[must_use]
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create a new concurrency error
    #[must_use]
    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::ConcurrencyError {
            message: message.into(),
        }
    }

    /// Whether this error ends the session regardless of buffered audio.
    ///
    /// Generation errors are only fatal before any audio is buffered, which
    /// the state machine decides; cancellation is a normal way to finish.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::GenerationError { .. } | Self::Cancelled { .. })
    }

    /// Get the error category for logging
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ProtocolError { .. } => "protocol",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::GenerationError { .. } => "generation",
            Self::SinkError { .. } => "sink",
            Self::Cancelled { .. } => "cancelled",
            Self::ConnectionError { .. } => "connection",
            Self::InvalidInput { .. } => "input",
            Self::ConfigurationError { .. } => "configuration",
            Self::ConcurrencyError { .. } => "concurrency",
        }
    }
}

impl From<std::io::Error> for SpeakError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Self::connection_closed(err.to_string()),
            _ => Self::connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SpeakError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(format!("JSON serialization error: {err}"))
    }
}

impl From<tokio::task::JoinError> for SpeakError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::concurrency(format!("Task failed: {err}"))
    }
}
