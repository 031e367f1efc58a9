use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Starting a session while one is active, or acting on a closed connection
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Teardown raced an in-flight operation. Callers abandon the operation
    /// without reporting it.
    #[error("Peer connection disposed during operation")]
    DisposedDuringOperation,

    #[error("Timed out after {0:?} waiting for the SFU to confirm the join")]
    JoinTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    /// The SFU answered a negotiation with something unusable
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Fatal error pushed by the SFU
    #[error("SFU error {code}: {message}")]
    Sfu {
        code: i32,
        message: String,
        should_retry: bool,
    },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error only reports a concurrent teardown
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self, Self::DisposedDuringOperation)
    }
}

impl From<vidcall_proto::events::SfuError> for Error {
    fn from(err: vidcall_proto::events::SfuError) -> Self {
        Self::Sfu {
            code: err.code,
            message: err.message,
            should_retry: err.should_retry,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
