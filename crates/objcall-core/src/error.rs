//! Error types for the object-call RPC stack.
//!
//! `RpcError` covers local failures (bad invocations, broken transports,
//! revival problems) as well as failures reported by the remote peer.
//! Every variant maps onto the closed wire enumeration [`ErrorCode`].

use crate::stub::ReturnMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Wire-level error codes.
///
/// The integer values are part of the protocol and must match on both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ErrorCode {
    /// Resolution failed, including blacklist hits.
    MethodNotFound = 0,
    /// The resolved method returned an error.
    ServiceError = 1,
    /// The resolved method panicked or the peer failed unexpectedly.
    InternalError = 2,
    /// Malformed envelope or batch entry.
    InvalidRequest = 3,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a wire integer back onto the enumeration.
    ///
    /// Unknown codes are reported as `InternalError`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::MethodNotFound,
            1 => ErrorCode::ServiceError,
            3 => ErrorCode::InvalidRequest,
            _ => ErrorCode::InternalError,
        }
    }

    /// Default human-readable message for responses built without a cause.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::ServiceError => "Service error",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::InvalidRequest => "Invalid request",
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = std::convert::Infallible;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        Ok(ErrorCode::from_code(code))
    }
}

/// Main error type for the object-call library.
#[derive(Debug, Error)]
pub enum RpcError {
    // Invocation errors
    #[error("method path is empty")]
    EmptyPath,

    #[error("call mode requires a timeout")]
    MissingTimeout,

    #[error("invocation in {0:?} mode has no response to await")]
    NotAwaitable(ReturnMode),

    // Remote outcomes
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    // Transport errors
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Protocol errors
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    // Serialization errors
    #[error("failed to revive {type_name}: {message}")]
    Revival { type_name: String, message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for object-call operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Convert to the wire error code used when this error answers a call.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            RpcError::InvalidRequest { .. }
            | RpcError::InvalidParams { .. }
            | RpcError::EmptyPath
            | RpcError::Revival { .. } => ErrorCode::InvalidRequest,

            RpcError::Remote { code, .. } => ErrorCode::from_code(*code),

            RpcError::Timeout(_)
            | RpcError::Transport { .. }
            | RpcError::ConnectionClosed
            | RpcError::NotAwaitable(_)
            | RpcError::MissingTimeout => ErrorCode::ServiceError,

            // All other errors are internal errors
            _ => ErrorCode::InternalError,
        }
    }

    /// True when the call's deadline elapsed before a response arrived.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    /// True when the failure came from the channel rather than the peer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. }
                | RpcError::ConnectionClosed
                | RpcError::FrameTooLarge { .. }
                | RpcError::Io { .. }
        )
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
        }
    }
}
