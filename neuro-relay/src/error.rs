//! Error types for neuro-relay

use crate::core::types::ClientId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// neuro-relay error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on a socket or device (fatal to the owning worker)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or policy-violating protocol line
    ///
    /// The broker answers these with `400 BAD REQUEST` and keeps going.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A source changed its channel count mid-session
    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelCountMismatch {
        /// Channel count established by the first batch of the session
        expected: usize,
        /// Channel count of the offending batch
        actual: usize,
    },

    /// Registry lookup on an id that is absent or already reaped
    #[error("Unknown client #{0}")]
    UnknownClient(ClientId),

    /// Broker rejected a command or answered something unexpected
    #[error("Unexpected response: {0}")]
    BadResponse(String),

    /// Client-side receiver worker is no longer running
    #[error("Data receiving worker found dead, possibly a connection error")]
    ReceiverStopped,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source device failure
    #[error("Device error: {0}")]
    Device(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// True for I/O errors that just mean "the peer went away"
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        )
    }
}
