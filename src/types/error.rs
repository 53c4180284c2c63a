//! Error types for Scriptorium
//!
//! One error enum for the gateway, the editing service and the client
//! transports. `code()` is the stable string carried in operation envelopes so
//! a remote client can rebuild the same variant.

use hyper::StatusCode;

use crate::schema::ValidationError;

/// Main error type for Scriptorium operations
#[derive(Debug, thiserror::Error)]
pub enum ScriptoriumError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ScriptoriumError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::WebSocket(_) => StatusCode::BAD_GATEWAY,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Stable machine-readable code for the operation envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::WebSocket(_) => "WEBSOCKET",
            Self::Http(_) => "HTTP",
            Self::Internal(_) => "INTERNAL",
            Self::Config(_) => "CONFIG",
            Self::Auth(_) => "AUTH",
        }
    }

    /// Message without the variant prefix
    pub fn detail(&self) -> String {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::WebSocket(m)
            | Self::Http(m)
            | Self::Internal(m)
            | Self::Config(m)
            | Self::Auth(m) => m.clone(),
            Self::Validation(v) => v.to_string(),
        }
    }

    /// Rebuild an error from an envelope `(code, message)` pair.
    ///
    /// Validation failures lose their structure on the wire and come back as
    /// `BadRequest`; the client validates locally before sending anyway.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "BAD_REQUEST" | "VALIDATION_FAILED" => Self::BadRequest(message),
            "UNAUTHORIZED" => Self::Unauthorized(message),
            "FORBIDDEN" => Self::Forbidden(message),
            "NOT_FOUND" => Self::NotFound(message),
            "CONFLICT" => Self::Conflict(message),
            "WEBSOCKET" => Self::WebSocket(message),
            "HTTP" => Self::Http(message),
            "CONFIG" => Self::Config(message),
            "AUTH" => Self::Auth(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<std::io::Error> for ScriptoriumError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ScriptoriumError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for ScriptoriumError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ScriptoriumError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ScriptoriumError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

impl From<reqwest::Error> for ScriptoriumError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type alias for Scriptorium operations
pub type Result<T> = std::result::Result<T, ScriptoriumError>;
