//! Device records and addressing
//!
//! A [`DeviceRecord`] is the engine's view of one mesh device: its hardware
//! address, short network address, declared endpoints, interview status,
//! and a free-form `meta` map that mirrors markers persisted on the device
//! database (including the configuration-version marker).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Meta key under which the applied configuration version is persisted
pub const CONFIGURED_META_KEY: &str = "configured";

/// Unique identifier of a mesh device (hardware address)
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from a hardware address string
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The raw address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(addr: &str) -> Self {
        Self(addr.to_string())
    }
}

/// Interview (pairing) status of a device
///
/// Only fully interviewed devices expose a trustworthy endpoint list, so
/// configuration is deferred until the interview succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewState {
    /// Device joined but interview has not started
    Pending,
    /// Interview currently running
    InProgress,
    /// Interview completed, device fully described
    Successful,
    /// Interview failed; device may retry on rejoin
    Failed,
}

impl InterviewState {
    /// Whether the device is fully paired and usable
    pub fn is_complete(&self) -> bool {
        matches!(self, InterviewState::Successful)
    }
}

impl std::fmt::Display for InterviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterviewState::Pending => write!(f, "pending"),
            InterviewState::InProgress => write!(f, "in_progress"),
            InterviewState::Successful => write!(f, "successful"),
            InterviewState::Failed => write!(f, "failed"),
        }
    }
}

/// One mesh device as tracked by the synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Hardware address
    pub id: DeviceId,
    /// Short network address assigned by the coordinator
    pub network_address: u16,
    /// Manufacturer name reported during interview
    pub manufacturer: Option<String>,
    /// Model identifier reported during interview
    pub model: Option<String>,
    /// Endpoint ids declared by the device, in interview order
    pub endpoints: Vec<u8>,
    /// Interview status
    pub interview: InterviewState,
    /// Persisted markers mirrored from the device database
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

impl DeviceRecord {
    /// Create a record for a freshly joined, not yet interviewed device
    pub fn new(id: impl Into<DeviceId>, network_address: u16) -> Self {
        Self {
            id: id.into(),
            network_address,
            manufacturer: None,
            model: None,
            endpoints: Vec::new(),
            interview: InterviewState::Pending,
            meta: HashMap::new(),
        }
    }

    /// The default endpoint used when an attribute is not endpoint-qualified
    ///
    /// Returns the first declared endpoint, or `None` for a device whose
    /// interview has not produced any.
    pub fn default_endpoint(&self) -> Option<u8> {
        self.endpoints.first().copied()
    }

    /// Whether the device declares the given endpoint id
    pub fn has_endpoint(&self, endpoint: u8) -> bool {
        self.endpoints.contains(&endpoint)
    }

    /// Configuration-version marker persisted on this device, if any
    ///
    /// An absent or non-integer marker means the device was never
    /// configured; it is never coerced to a default version.
    pub fn configured_marker(&self) -> Option<i64> {
        self.meta.get(CONFIGURED_META_KEY).and_then(Value::as_i64)
    }

    /// Persist the configuration-version marker on this record
    pub fn set_configured_marker(&mut self, version: i64) {
        self.meta
            .insert(CONFIGURED_META_KEY.to_string(), Value::from(version));
    }
}

impl From<DeviceId> for DeviceRecord {
    fn from(id: DeviceId) -> Self {
        Self::new(id, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeviceRecord {
        let mut r = DeviceRecord::new("0x00124b0012345678", 0x4f21);
        r.endpoints = vec![1, 2, 3];
        r.interview = InterviewState::Successful;
        r
    }

    #[test]
    fn test_default_endpoint_is_first_declared() {
        assert_eq!(record().default_endpoint(), Some(1));
        assert_eq!(DeviceRecord::new("0x00", 1).default_endpoint(), None);
    }

    #[test]
    fn test_has_endpoint() {
        let r = record();
        assert!(r.has_endpoint(2));
        assert!(!r.has_endpoint(9));
    }

    #[test]
    fn test_configured_marker_roundtrip() {
        let mut r = record();
        assert_eq!(r.configured_marker(), None);

        r.set_configured_marker(2);
        assert_eq!(r.configured_marker(), Some(2));
    }

    #[test]
    fn test_non_integer_marker_reads_as_unconfigured() {
        let mut r = record();
        r.meta
            .insert(CONFIGURED_META_KEY.to_string(), Value::from("yes"));
        assert_eq!(r.configured_marker(), None);
    }

    #[test]
    fn test_interview_state_display() {
        assert_eq!(InterviewState::Successful.to_string(), "successful");
        assert!(InterviewState::Successful.is_complete());
        assert!(!InterviewState::InProgress.is_complete());
    }
}
