//! # Error Handling
//!
//! Two families of errors live here:
//! - **AppError**: problems surfaced by the HTTP API, converted to JSON responses
//! - **RelayError**: problems inside a running audio relay session
//!
//! ## Relay Error Taxonomy:
//! - **Connection**: sidecar unreachable or timed out. Recoverable by retrying,
//!   then the session degrades to text-only instead of closing
//! - **Transcode**: a codec pipeline died. Fatal for that direction only
//! - **ClientDisconnect**: the caller went away. Ends the session cleanly
//! - **ProtocolViolation**: malformed control message. Logged and dropped
//!
//! ## Why two types:
//! HTTP handlers need a status code for every error. Relay errors never reach
//! an HTTP response; they travel as status/error messages on the client
//! WebSocket and as session events.

use crate::audio::codec::Direction;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Session capacity reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The relay cannot take more sessions right now
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Sidecar max_reconnect_attempts must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised inside a relay session.
///
/// ## Rust Concepts:
/// - **Struct variants**: `Connection { attempts, reason }` carries named data
/// - **Clone**: Errors are reported to the event sink and the client, so
///   they get copied instead of moved
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Sidecar unreachable, refused, or timed out
    Connection { attempts: u32, reason: String },

    /// A codec pipeline failed; only its direction is affected
    Transcode { direction: Direction, reason: String },

    /// The client side of the session is gone
    ClientDisconnect,

    /// A control message could not be understood
    ProtocolViolation(String),
}

impl RelayError {
    pub fn connection(attempts: u32, reason: impl Into<String>) -> Self {
        RelayError::Connection { attempts, reason: reason.into() }
    }

    pub fn transcode(direction: Direction, reason: impl Into<String>) -> Self {
        RelayError::Transcode { direction, reason: reason.into() }
    }

    /// Machine-readable code used in client error messages and events.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Connection { .. } => "sidecar_unavailable",
            RelayError::Transcode { .. } => "transcode_failure",
            RelayError::ClientDisconnect => "client_disconnect",
            RelayError::ProtocolViolation(_) => "protocol_violation",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connection { attempts, reason } => {
                write!(f, "Sidecar connection failed after {} attempt(s): {}", attempts, reason)
            }
            RelayError::Transcode { direction, reason } => {
                write!(f, "{} transcoder failed: {}", direction, reason)
            }
            RelayError::ClientDisconnect => write!(f, "Client disconnected"),
            RelayError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Any WebSocket failure talking to the sidecar is a connection problem.
impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::connection(1, err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::ProtocolViolation(err.to_string())
    }
}
