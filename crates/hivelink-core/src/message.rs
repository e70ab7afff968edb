//! Incoming wire messages from the mesh network controller
//!
//! The network controller delivers every frame addressed to the bridge as
//! an [`IncomingMessage`]. The engine correlates solicited responses to
//! pending requests by `(device, endpoint, sequence)` and routes everything
//! else through the unsolicited report path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceId;

/// Classification of an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Device-initiated attribute report
    AttributeReport,
    /// Response to an attribute read
    ReadResponse,
    /// Response to a cluster command
    CommandResponse,
    /// Protocol-level acknowledgement with no attribute content
    DefaultResponse,
    /// Frame the controller could not classify
    Raw,
}

impl MessageKind {
    /// Diagnostic classes carry no attribute content and are safe to drop
    /// without a converter match.
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, MessageKind::DefaultResponse | MessageKind::Raw)
    }

    /// Response classes answer an outstanding request and are expected to
    /// match a pending correlation key.
    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::ReadResponse | MessageKind::CommandResponse)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::AttributeReport => write!(f, "attribute_report"),
            MessageKind::ReadResponse => write!(f, "read_response"),
            MessageKind::CommandResponse => write!(f, "command_response"),
            MessageKind::DefaultResponse => write!(f, "default_response"),
            MessageKind::Raw => write!(f, "raw"),
        }
    }
}

/// One frame delivered by the network controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Source device
    pub device: DeviceId,
    /// Source endpoint on the device
    pub endpoint: u8,
    /// Cluster the frame belongs to (e.g. `genOnOff`)
    pub cluster: String,
    /// Frame classification
    pub kind: MessageKind,
    /// Decoded cluster payload
    pub payload: Value,
    /// Transaction sequence number
    pub sequence: u8,
    /// Group address, for group-cast frames
    pub group_id: Option<u16>,
    /// When the controller handed the frame to the bridge
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// Create a message received now
    pub fn new(
        device: impl Into<DeviceId>,
        endpoint: u8,
        cluster: impl Into<String>,
        kind: MessageKind,
        payload: Value,
        sequence: u8,
    ) -> Self {
        Self {
            device: device.into(),
            endpoint,
            cluster: cluster.into(),
            kind,
            payload,
            sequence,
            group_id: None,
            received_at: Utc::now(),
        }
    }

    /// Correlation key text for matching this frame to a pending request
    pub fn correlation_key(&self) -> String {
        format!("{}/{}/{}", self.device, self.endpoint, self.sequence)
    }
}
