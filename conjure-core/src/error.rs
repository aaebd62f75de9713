//! Error types for conjure operations

use thiserror::Error;

/// Store layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unreachable: {reason}")]
    Connection { reason: String },

    #[error("Store timed out during {operation}: {reason}")]
    Timeout { operation: String, reason: String },

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Unexpected reply from {command}: {reason}")]
    UnexpectedReply { command: String, reason: String },
}

impl StoreError {
    /// Whether this error means the store could not be reached at all.
    ///
    /// Only these errors are eligible for degradation; a command the store
    /// rejected is never silently turned into a cache miss.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, StoreError::Connection { .. } | StoreError::Timeout { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Contract violations between the engine and the store.
///
/// These are programming errors: they are surfaced immediately and are
/// never retried or degraded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{operation} requires at least one key")]
    EmptyKeys { operation: String },

    #[error("{operation} mixes routing tags: expected {expected:?}, found {found:?} on {key}")]
    CrossSlot {
        operation: String,
        expected: String,
        found: String,
        key: String,
    },

    #[error("Invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid argument to {operation}: {reason}")]
    InvalidArgument { operation: String, reason: String },
}

/// Payload encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: String, reason: String },

    #[error("Failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },
}

/// Master error type for all conjure errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConjureError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ConjureError {
    /// Whether this is a store connection failure eligible for degradation.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ConjureError::Store(e) if e.is_connection_failure())
    }
}

impl From<serde_json::Error> for ConjureError {
    fn from(e: serde_json::Error) -> Self {
        ConjureError::Codec(CodecError::Decode {
            what: "json payload".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Result type alias for conjure operations.
pub type ConjureResult<T> = Result<T, ConjureError>;

// =============================================================================
// TESTS
// =============================================================================
