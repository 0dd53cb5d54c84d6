//! Client controller error types.

use thiserror::Error;

/// Client controller error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Local capture failed (permissions, no device). Not retried.
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// The peer connection refused an operation.
    #[error("Peer connection error: {0}")]
    Peer(String),

    /// A frame could not be handed to the signaling transport.
    #[error("Signaling delivery failed: {0}")]
    Signaling(String),

    /// The intent does not apply in the current phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The controller task is gone.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Message safe to show to the user.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            ClientError::MediaAccessDenied(_) => {
                "Camera or microphone unavailable. Check your device permissions."
            }
            ClientError::Peer(_) => "Connection problem",
            ClientError::Signaling(_) => "Could not reach the server",
            ClientError::InvalidState(_) => "That action is not available right now",
            ClientError::Internal(_) => "Something went wrong",
        }
    }
}
