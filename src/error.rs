//! Error types for gateway supervision and relay.
//!
//! Errors fall into three classes that decide how they travel:
//!
//! - **Transient**: device open failures, shell failures, store hiccups. These are
//!   absorbed by the owning component, reported as a [`Note`](crate::Note) and retried.
//! - **Protocol**: CRC mismatches, unexpected message types, malformed report
//!   fields. The offending datagram or line is dropped and processing continues.
//! - **Usage**: starting twice or stopping before start. These are returned
//!   immediately to the caller because they indicate a caller bug.
//!
//! ```rust
//! use m2m_gateway::GatewayError;
//!
//! let error = GatewayError::io_error("open /dev/ttyUSB2", std::io::ErrorKind::NotFound.into());
//! assert!(error.is_retryable());
//! assert!(!GatewayError::AlreadyStarted { component: "modem" }.is_retryable());
//! ```

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("{component} already started")]
    AlreadyStarted { component: &'static str },

    #[error("{component} not started")]
    NotStarted { component: &'static str },

    #[error("not ready")]
    NotReady,

    #[error("busy: a command is already pending")]
    Busy,

    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CRC found: {found} - CRC expected: {expected}")]
    Crc { found: u8, expected: u8 },

    #[error("decode error: {details}")]
    Decode { details: String },

    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("command '{command}' exited with {code}")]
    Shell { command: String, code: i32, output: String },

    #[error("store error: {reason}")]
    Store { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("unexpected message type: {message_type}")]
    UnexpectedMessageType { message_type: u8 },

    #[error("{context} closed")]
    Closed { context: String },
}

impl GatewayError {
    /// Returns whether the condition is environmental and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Io { .. } => true,
            GatewayError::Shell { .. } => true,
            GatewayError::Store { .. } => true,
            GatewayError::Closed { .. } => true,
            GatewayError::NotReady => true,
            GatewayError::Busy => true,
            GatewayError::AlreadyStarted { .. } => false,
            GatewayError::NotStarted { .. } => false,
            GatewayError::Crc { .. } => false,
            GatewayError::Decode { .. } => false,
            GatewayError::InvalidValue { .. } => false,
            GatewayError::Config { .. } => false,
            GatewayError::UnexpectedMessageType { .. } => false,
        }
    }

    /// Returns whether this error signals a caller bug rather than an
    /// environmental condition.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, GatewayError::AlreadyStarted { .. } | GatewayError::NotStarted { .. })
    }

    /// Helper constructor for I/O errors with context.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        GatewayError::Io { context: context.into(), source }
    }

    /// Helper constructor for key-value store errors.
    pub fn store_error(reason: impl Into<String>) -> Self {
        GatewayError::Store { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        GatewayError::Config { reason: reason.into() }
    }

    /// Helper constructor for wire decode errors.
    pub fn decode_error(details: impl Into<String>) -> Self {
        GatewayError::Decode { details: details.into() }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io { context: "<unknown>".to_string(), source: err }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Config { reason: err.to_string() }
    }
}
