//! Text frame encoding and decoding.

use crate::events::{ClientEvent, ServerEvent};
use serde::Serialize;
use thiserror::Error;

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or names an unknown event.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The event could not be serialized.
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Decode a client-originated text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON or unknown events.
pub fn decode_client(text: &str) -> Result<ClientEvent, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a server-originated text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON or unknown events.
pub fn decode_server(text: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode an event as a text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}
