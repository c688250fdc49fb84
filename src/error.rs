//! Error types for Galena
//!
//! This module defines all error types used throughout the Galena codebase.
//! Uses `thiserror` for ergonomic error definitions.

use std::io;
use thiserror::Error;

/// Main error type for Galena operations
#[derive(Error, Debug)]
pub enum GalenaError {
    /// A path expression failed to parse
    #[error("Invalid path expression: {0}")]
    InvalidPath(String),

    /// A path does not resolve against the document tree
    #[error("Path not found")]
    PathNotFound,

    /// The operation is not valid for the addressed value
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON decoding or encoding failed
    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The connection does not support incremental streaming
    #[error("Streaming not supported by this connection")]
    StreamingUnsupported,

    /// The hub has reached its subscriber limit
    #[error("Subscriber limit reached")]
    AtCapacity,

    /// The hub is shutting down and rejects new subscribers
    #[error("Service is shutting down")]
    Unavailable,

    /// A subscriber's message buffer is full; the frame was dropped
    #[error("Subscriber message queue full")]
    QueueFull,

    /// The subscriber's output stream has closed
    #[error("Subscriber stream closed")]
    StreamClosed,

    /// The request body exceeds the configured limit
    #[error("Request body too large (max {0} bytes)")]
    BodyTooLarge(usize),

    /// A required request parameter is missing
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// MongoDB driver error
    #[error("Backend error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// BSON encoding error
    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] mongodb::bson::ser::Error),

    /// BSON decoding error
    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] mongodb::bson::de::Error),

    /// The storage backend is unreachable or timed out
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Galena operations
pub type Result<T> = std::result::Result<T, GalenaError>;

impl GalenaError {
    /// HTTP status code this error translates to at the transport boundary
    pub fn status_code(&self) -> u16 {
        match self {
            GalenaError::InvalidPath(_)
            | GalenaError::InvalidOperation(_)
            | GalenaError::Decode(_)
            | GalenaError::MissingParameter(_) => 400,
            GalenaError::PathNotFound => 404,
            GalenaError::BodyTooLarge(_) => 413,
            GalenaError::AtCapacity | GalenaError::Unavailable => 503,
            GalenaError::Mongo(_) | GalenaError::Backend(_) => 502,
            _ => 500,
        }
    }

    /// Short machine-readable error kind used in JSON error envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            GalenaError::InvalidPath(_) => "invalid_path",
            GalenaError::PathNotFound => "path_not_found",
            GalenaError::InvalidOperation(_) => "invalid_operation",
            GalenaError::Decode(_) => "invalid_json",
            GalenaError::StreamingUnsupported => "streaming_unsupported",
            GalenaError::AtCapacity => "at_capacity",
            GalenaError::Unavailable => "unavailable",
            GalenaError::QueueFull => "queue_full",
            GalenaError::StreamClosed => "stream_closed",
            GalenaError::BodyTooLarge(_) => "body_too_large",
            GalenaError::MissingParameter(_) => "missing_parameter",
            GalenaError::Mongo(_) | GalenaError::Backend(_) => "backend_error",
            GalenaError::BsonEncode(_) | GalenaError::BsonDecode(_) => "encoding_error",
            GalenaError::Config(_) => "config_error",
            GalenaError::Io(_) => "io_error",
            GalenaError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GalenaError::InvalidPath("x".into()).status_code(), 400);
        assert_eq!(GalenaError::PathNotFound.status_code(), 404);
        assert_eq!(GalenaError::AtCapacity.status_code(), 503);
        assert_eq!(GalenaError::Unavailable.status_code(), 503);
        assert_eq!(GalenaError::StreamingUnsupported.status_code(), 500);
        assert_eq!(GalenaError::BodyTooLarge(1024).status_code(), 413);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(GalenaError::PathNotFound.kind(), "path_not_found");
        assert_eq!(GalenaError::QueueFull.kind(), "queue_full");
        assert_eq!(
            GalenaError::MissingParameter("path".into()).kind(),
            "missing_parameter"
        );
    }
}
