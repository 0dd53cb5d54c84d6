//! Call Service error types.
//!
//! Error types map to signaling error codes for `call-error` frames and to
//! HTTP status codes for the history API. Internal details are logged
//! server-side but not exposed to clients.

use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use call_protocol::CallStatus;
use serde::Serialize;
use thiserror::Error;

/// Call Service error type.
///
/// Maps to signaling error codes:
/// - `InvalidRequest`: `BAD_REQUEST` (1)
/// - `NotRegistered`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `CallNotFound`, `ParticipantNotFound`: `NOT_FOUND` (4)
/// - `Conflict`, `Busy`: `CONFLICT` (5)
/// - `Store`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Draining`, `CapacityExceeded`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum CallError {
    /// No call with this id is known.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// The user is not a participant of the call.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// The transition lost a race or the call is already settled.
    #[error("Conflict: {message}")]
    Conflict {
        status: Option<CallStatus>,
        message: String,
    },

    /// The initiator or an invitee is already in a call.
    #[error("User busy: {0}")]
    Busy(String),

    /// The user may not perform this transition.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed or semantically invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The session has not sent `join-user-room` yet.
    #[error("Session not registered")]
    NotRegistered,

    /// Call record store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The service is shutting down.
    #[error("Call service is draining")]
    Draining,

    /// Too many concurrent calls.
    #[error("Call service at capacity")]
    CapacityExceeded,
}

impl CallError {
    /// Build a conflict error for a call in `status`.
    #[must_use]
    pub fn conflict(status: CallStatus) -> Self {
        CallError::Conflict {
            status: Some(status),
            message: format!("Call is already {status}"),
        }
    }

    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            CallError::InvalidRequest(_) => 1,    // BAD_REQUEST
            CallError::NotRegistered => 2,        // UNAUTHORIZED
            CallError::PermissionDenied(_) => 3,  // FORBIDDEN
            CallError::CallNotFound(_) | CallError::ParticipantNotFound(_) => 4, // NOT_FOUND
            CallError::Conflict { .. } | CallError::Busy(_) => 5, // CONFLICT
            CallError::Store(_) | CallError::Internal(_) => 6, // INTERNAL_ERROR
            CallError::Draining | CallError::CapacityExceeded => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            CallError::CallNotFound(_) => "call_not_found",
            CallError::ParticipantNotFound(_) => "participant_not_found",
            CallError::Conflict { .. } => "conflict",
            CallError::Busy(_) => "busy",
            CallError::PermissionDenied(_) => "permission_denied",
            CallError::InvalidRequest(_) => "invalid_request",
            CallError::NotRegistered => "not_registered",
            CallError::Store(_) => "store",
            CallError::Internal(_) => "internal",
            CallError::Draining => "draining",
            CallError::CapacityExceeded => "capacity_exceeded",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CallError::CallNotFound(_) => "Call not found".to_string(),
            CallError::ParticipantNotFound(_) => "You are not a participant of this call".to_string(),
            CallError::Conflict { message, .. } => message.clone(),
            CallError::Busy(_) => "User is busy in another call".to_string(),
            CallError::PermissionDenied(reason) | CallError::InvalidRequest(reason) => {
                reason.clone()
            }
            CallError::NotRegistered => "Join your user room first".to_string(),
            CallError::Store(_) | CallError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            CallError::Draining => "Server is shutting down, please reconnect".to_string(),
            CallError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
        }
    }

    /// HTTP status for the history API.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self.error_code() {
            1 => StatusCode::BAD_REQUEST,
            2 => StatusCode::UNAUTHORIZED,
            3 => StatusCode::FORBIDDEN,
            4 => StatusCode::NOT_FOUND,
            5 => StatusCode::CONFLICT,
            7 => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body for the history API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        if matches!(self, CallError::Store(_) | CallError::Internal(_)) {
            // Log actual error server-side, return generic message to client
            tracing::error!(target: "cs.api", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            code: self.error_type_label(),
            message: self.client_message(),
        };

        (self.http_status(), Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CallError::InvalidRequest("x".into()).error_code(), 1);
        assert_eq!(CallError::NotRegistered.error_code(), 2);
        assert_eq!(CallError::PermissionDenied("x".into()).error_code(), 3);
        assert_eq!(CallError::CallNotFound("c1".into()).error_code(), 4);
        assert_eq!(CallError::ParticipantNotFound("u1".into()).error_code(), 4);
        assert_eq!(CallError::conflict(CallStatus::Missed).error_code(), 5);
        assert_eq!(CallError::Busy("u1".into()).error_code(), 5);
        assert_eq!(
            CallError::Store(StoreError::Database("connection reset".into())).error_code(),
            6
        );
        assert_eq!(CallError::Internal("boom".into()).error_code(), 6);
        assert_eq!(CallError::Draining.error_code(), 7);
        assert_eq!(CallError::CapacityExceeded.error_code(), 7);
    }

    #[test]
    fn test_client_message_hides_internals() {
        let err = CallError::Store(StoreError::Database(
            "password authentication failed for user calls".into(),
        ));
        assert_eq!(err.client_message(), "An internal error occurred");
        assert!(!err.client_message().contains("password"));

        let err = CallError::Internal("channel send failed: closed".into());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_conflict_carries_status() {
        let err = CallError::conflict(CallStatus::Ended);
        match &err {
            CallError::Conflict { status, .. } => assert_eq!(*status, Some(CallStatus::Ended)),
            other => unreachable!("unexpected {other:?}"),
        }
        assert_eq!(err.client_message(), "Call is already ended");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            CallError::InvalidRequest("bad status".into()).http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CallError::CallNotFound("c1".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CallError::Internal("x".into()).http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
