//! Event and handshake error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_core::StoreError;
use serde_json::{Value, json};

// ── Error code constants ────────────────────────────────────────────

/// Missing or malformed event parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Addressed message, conversation, user or lock does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Caller is not allowed to act on the resource.
pub const FORBIDDEN: &str = "FORBIDDEN";
/// Resource is locked by another identity.
pub const CONFLICT: &str = "CONFLICT";
/// Per-event rate limit exceeded.
pub const RATE_LIMITED: &str = "RATE_LIMITED";
/// Event name not recognised.
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
/// A collaborator call or the handler itself ran out of time.
pub const TIMEOUT: &str = "TIMEOUT";
/// Unexpected failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Frame could not be parsed (sent as an `error` event, there is no ack id).
pub const INVALID_FRAME: &str = "INVALID_FRAME";

/// Failure of an event handler, returned to the client in the ack.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Required parameter missing or wrong type.
    #[error("{0}")]
    InvalidParams(String),

    /// Requested resource not found.
    #[error("{0}")]
    NotFound(String),

    /// Caller is not authorized; nothing was mutated.
    #[error("{0}")]
    Forbidden(String),

    /// Resource is locked by someone else.
    #[error("{message}")]
    Conflict {
        /// Human-readable message.
        message: String,
        /// Identity holding the lock.
        locked_by: Option<String>,
    },

    /// The caller exceeded the event's rate limit.
    #[error("Too many requests, please slow down")]
    RateLimited {
        /// Canonical event name.
        event: &'static str,
    },

    /// The event name is not part of the protocol.
    #[error("unknown event '{name}'")]
    UnknownEvent {
        /// Name as received.
        name: String,
    },

    /// A bounded call did not finish in time.
    #[error("{operation} timed out")]
    Timeout {
        /// What timed out.
        operation: &'static str,
    },

    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl EventError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::NotFound(_) => NOT_FOUND,
            Self::Forbidden(_) => FORBIDDEN,
            Self::Conflict { .. } => CONFLICT,
            Self::RateLimited { .. } => RATE_LIMITED,
            Self::UnknownEvent { .. } => UNKNOWN_EVENT,
            Self::Timeout { .. } => TIMEOUT,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Client-facing message. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal error".to_owned(),
            other => other.to_string(),
        }
    }

    /// Ack body: `{ok: false, error, code, lockedBy?}`.
    pub fn to_ack_body(&self) -> Value {
        let mut body = json!({
            "ok": false,
            "error": self.client_message(),
            "code": self.code(),
        });
        if let Self::Conflict {
            locked_by: Some(holder),
            ..
        } = self
        {
            body["lockedBy"] = Value::String(holder.clone());
        }
        body
    }

    /// Shorthand for a parameter error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }
}

impl From<StoreError> for EventError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, .. } => Self::NotFound(format!("{entity} not found")),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Handshake rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential in header, query or cookie.
    #[error("no token")]
    NoToken,
    /// Credential failed verification or carries no subject.
    #[error("invalid token")]
    InvalidToken,
    /// Credential is valid but names an unknown user.
    #[error("user not found")]
    UserNotFound,
    /// The user store could not be consulted.
    #[error("user store unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "Service Unavailable", "reason": "user store unavailable"}),
            ),
            other => (
                StatusCode::UNAUTHORIZED,
                json!({"error": "Unauthorized", "reason": other.to_string()}),
            ),
        };
        (status, Json(body)).into_response()
    }
}
