//! Error types shared by converters and profile catalogs
//!
//! Errors raised inside converter handlers and configure routines use this
//! taxonomy; the synchronization engine wraps them when they cross its
//! boundary.

use thiserror::Error;

/// Errors produced by converters, profiles, and catalog code
#[derive(Error, Debug)]
pub enum CoreError {
    /// Attribute value could not be encoded or decoded
    #[error("Conversion failed for '{key}': {reason}")]
    ConversionFailed {
        /// Attribute key being converted
        key: String,
        /// Failure reason
        reason: String,
    },

    /// Converter does not implement the requested direction
    #[error("Operation not supported by converter: {0}")]
    UnsupportedOperation(String),

    /// Attribute value was malformed for the target attribute
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Attribute key
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Sending a command through the network controller failed
    #[error("Network command failed: {0}")]
    Network(String),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Convenience constructor for conversion failures
    pub fn conversion(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::ConversionFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for invalid values
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
