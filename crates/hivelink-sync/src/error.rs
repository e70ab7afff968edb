//! Error types for the synchronization engine
//!
//! Per-attribute converter failures are recovered inside the pipeline and
//! never surface here; this taxonomy covers the failures a caller of the
//! engine facade can actually observe.

use thiserror::Error;

use hivelink_core::CoreError;

/// Why pending requests were flushed in bulk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Network controller lost its adapter connection
    Disconnected,
    /// Engine is shutting down
    Shutdown,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushReason::Disconnected => write!(f, "disconnected"),
            FlushReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Main error type for synchronization operations
#[derive(Error, Debug)]
pub enum SyncError {
    // ===== Device/Profile Errors =====
    /// No profile exists for the device in the converter catalog
    #[error("Unsupported device: no profile for {device} ({detail})")]
    UnsupportedDevice {
        /// Device hardware address
        device: String,
        /// Manufacturer/model detail for logs
        detail: String,
    },

    /// Device is not registered with the engine
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Attribute named an endpoint the device does not declare
    #[error("Unknown endpoint '{name}' on device {device}")]
    UnknownEndpoint {
        /// Endpoint name from the attribute key
        name: String,
        /// Device hardware address
        device: String,
    },

    /// No converter in the profile declares the attribute key
    #[error("No converter for attribute '{0}'")]
    NoConverter(String),

    // ===== Correlation Errors =====
    /// Pending request expired before a response arrived
    #[error("Response timeout for pending request {key}")]
    ResponseTimeout {
        /// Correlation key of the expired entry
        key: String,
    },

    /// A read batch produced zero responses
    #[error("No response from device {0}")]
    NoResponse(String),

    /// Pending key already in flight
    #[error("Duplicate pending key: {0}")]
    DuplicateKey(String),

    /// Pending entries were discarded in bulk
    #[error("Pending request flushed: {0}")]
    Flushed(FlushReason),

    // ===== Configuration Errors =====
    /// Commissioning routine failed
    #[error("Configuration of {device} failed (attempt {attempt}): {reason}")]
    ConfigurationFailed {
        /// Device hardware address
        device: String,
        /// Failed attempt number (1-based)
        attempt: u32,
        /// Failure reason
        reason: String,
    },

    // ===== Transport/Lifecycle Errors =====
    /// State-update channel closed by the accessory layer
    #[error("Update channel closed")]
    ChannelClosed,

    /// Error raised by converter or catalog code
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if re-issuing the operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SyncError::ResponseTimeout { .. } | SyncError::NoResponse(_) | SyncError::Flushed(_)
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::UnsupportedDevice { .. } => "UNSUPPORTED_DEVICE",
            SyncError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            SyncError::UnknownEndpoint { .. } => "UNKNOWN_ENDPOINT",
            SyncError::NoConverter(_) => "NO_CONVERTER",
            SyncError::ResponseTimeout { .. } => "RESPONSE_TIMEOUT",
            SyncError::NoResponse(_) => "NO_RESPONSE",
            SyncError::DuplicateKey(_) => "DUPLICATE_KEY",
            SyncError::Flushed(_) => "FLUSHED",
            SyncError::ConfigurationFailed { .. } => "CONFIGURATION_FAILED",
            SyncError::ChannelClosed => "CHANNEL_CLOSED",
            SyncError::Core(_) => "CONVERTER_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SyncError::NoConverter("brightness".to_string());
        assert_eq!(err.error_code(), "NO_CONVERTER");

        let err = SyncError::Flushed(FlushReason::Shutdown);
        assert_eq!(err.error_code(), "FLUSHED");
        assert!(err.to_string().contains("shutdown"));
    }

    #[test]
    fn test_is_retriable() {
        assert!(SyncError::NoResponse("0x01".to_string()).is_retriable());
        assert!(SyncError::ResponseTimeout {
            key: "0x01/1/7".to_string()
        }
        .is_retriable());
        assert!(!SyncError::NoConverter("x".to_string()).is_retriable());
        assert!(!SyncError::UnknownDevice("0x01".to_string()).is_retriable());
    }

    #[test]
    fn test_core_error_wrapping() {
        let err: SyncError = CoreError::conversion("state", "bad value").into();
        assert_eq!(err.error_code(), "CONVERTER_ERROR");
    }
}
