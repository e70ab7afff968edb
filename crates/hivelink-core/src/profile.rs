//! Device profiles and the converter abstraction
//!
//! A [`DeviceProfile`] is the vendor-supplied description of one device
//! model: which logical attributes it understands and how each one maps to
//! wire commands. The mapping itself lives in [`Converter`] implementations
//! provided by the catalog; the synchronization engine resolves and invokes
//! them but never defines vendor behavior itself.
//!
//! Converters reach the network exclusively through the [`CommandSink`]
//! trait, so catalogs stay independent of the concrete controller.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::device::{DeviceId, DeviceRecord};
use crate::error::{CoreError, Result};
use crate::message::{IncomingMessage, MessageKind};
use crate::state::StateMap;

/// Outbound command path available to converters and configure routines
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Send one cluster command to a device endpoint
    ///
    /// `sequence` is the transaction number assigned by the engine; read
    /// style commands must carry it on the wire so the response can be
    /// correlated.
    async fn send_command(
        &self,
        device: &DeviceId,
        endpoint: u8,
        cluster: &str,
        sequence: u8,
        payload: Value,
    ) -> Result<()>;
}

/// Everything a converter handler needs for one invocation
pub struct ConvertContext<'a> {
    /// Device the attribute belongs to
    pub device: &'a DeviceRecord,
    /// Target endpoint resolved by the pipeline
    pub endpoint: u8,
    /// Snapshot of the device's cached state
    pub state: &'a StateMap,
    /// Full attribute map of the originating call
    ///
    /// A converter serving several keys is invoked once per call; sibling
    /// values (e.g. `saturation` next to `hue`) are read from here.
    pub request: &'a StateMap,
    /// Caller-supplied options (transition times, etc.)
    pub options: &'a StateMap,
    /// Transaction sequence number reserved for this invocation
    pub sequence: u8,
    /// Command path to the network controller
    pub sink: &'a dyn CommandSink,
}

/// Result of a successful encode (set) invocation
#[derive(Debug, Default)]
pub struct SetOutcome {
    /// Partial state to merge into the device cache
    pub state: StateMap,
    /// Recommended delay before re-reading the written attributes
    ///
    /// Some firmwares apply writes asynchronously and do not report the
    /// settled value; when present, the engine schedules a follow-up read.
    pub read_after: Option<Duration>,
}

impl SetOutcome {
    /// Outcome carrying only a state delta
    pub fn state(state: StateMap) -> Self {
        Self {
            state,
            read_after: None,
        }
    }

    /// Attach a read-after-write delay
    pub fn with_read_after(mut self, delay: Duration) -> Self {
        self.read_after = Some(delay);
        self
    }
}

/// One attribute encode/decode handler from the vendor catalog
///
/// A converter may serve several logical attributes at once (a color
/// converter typically owns both `hue` and `saturation`); the pipeline
/// invokes it at most once per endpoint and call.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Logical attribute keys this converter serves
    fn keys(&self) -> &[&str];

    /// Cluster the converter operates on
    fn cluster(&self) -> &str;

    /// Incoming frame kinds the decode handler understands
    fn message_kinds(&self) -> &[MessageKind] {
        &[MessageKind::AttributeReport, MessageKind::ReadResponse]
    }

    /// Whether an encode (set) handler is available
    fn can_set(&self) -> bool {
        false
    }

    /// Whether a read (get) handler is available
    fn can_get(&self) -> bool {
        false
    }

    /// Encode a set: translate `key = value` into wire commands
    async fn encode_set(
        &self,
        _ctx: &ConvertContext<'_>,
        key: &str,
        _value: &Value,
    ) -> Result<SetOutcome> {
        Err(CoreError::UnsupportedOperation(format!("set {key}")))
    }

    /// Issue a read for `key`; the response arrives asynchronously under
    /// the context's sequence number
    async fn encode_get(&self, _ctx: &ConvertContext<'_>, key: &str) -> Result<()> {
        Err(CoreError::UnsupportedOperation(format!("get {key}")))
    }

    /// Decode an incoming frame into logical attributes
    fn decode(&self, _device: &DeviceRecord, _message: &IncomingMessage) -> Result<StateMap> {
        Ok(StateMap::new())
    }
}

/// One-time commissioning sequence for a device model
///
/// Typically binds reporting clusters and writes reporting intervals.
/// Invoked at most once per configuration version; see the engine's
/// configuration controller for retry semantics.
#[async_trait]
pub trait ConfigureRoutine: Send + Sync {
    /// Run the commissioning sequence
    async fn run(
        &self,
        device: &DeviceRecord,
        coordinator_endpoint: u8,
        sink: &dyn CommandSink,
    ) -> Result<()>;
}

/// Vendor-supplied description of one device model
#[derive(Clone)]
pub struct DeviceProfile {
    /// Manufacturer name matched against the device record
    pub vendor: String,
    /// Model identifier matched against the device record
    pub model: String,
    /// Human-readable description
    pub description: String,
    /// Converters, in catalog order (order defines converter identity)
    pub converters: Vec<Arc<dyn Converter>>,
    /// Named endpoints (`left`, `bottom_right`, …) to endpoint ids
    pub endpoints: HashMap<String, u8>,
    /// Commissioning sequence, absent for configuration-free devices
    pub configure: Option<Arc<dyn ConfigureRoutine>>,
    /// Version marker persisted on the device after commissioning
    pub configure_version: i64,
}

impl DeviceProfile {
    /// Create a profile with no converters or endpoints
    pub fn new(
        vendor: impl Into<String>,
        model: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            description: description.into(),
            converters: Vec::new(),
            endpoints: HashMap::new(),
            configure: None,
            configure_version: 1,
        }
    }

    /// First converter (with its catalog position) declaring `key`
    pub fn converter_for_key(&self, key: &str) -> Option<(usize, &Arc<dyn Converter>)> {
        self.converters
            .iter()
            .enumerate()
            .find(|(_, c)| c.keys().contains(&key))
    }

    /// Converters (with positions) matching an incoming frame's cluster
    /// and kind
    pub fn converters_for_message(
        &self,
        message: &IncomingMessage,
    ) -> Vec<(usize, &Arc<dyn Converter>)> {
        self.converters
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.cluster() == message.cluster && c.message_kinds().contains(&message.kind)
            })
            .collect()
    }

    /// Resolve a declared endpoint name to its endpoint id
    pub fn endpoint_id(&self, name: &str) -> Option<u8> {
        self.endpoints.get(name).copied()
    }
}

impl std::fmt::Debug for DeviceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProfile")
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("converters", &self.converters.len())
            .field("endpoints", &self.endpoints)
            .field("has_configure", &self.configure.is_some())
            .field("configure_version", &self.configure_version)
            .finish()
    }
}

/// Lookup seam into the vendor converter catalog
pub trait ProfileResolver: Send + Sync {
    /// Resolve the profile for a device, `None` for unsupported hardware
    fn resolve(&self, device: &DeviceRecord) -> Option<Arc<DeviceProfile>>;
}

/// Catalog backed by a static (manufacturer, model) table
#[derive(Default)]
pub struct StaticProfileCatalog {
    profiles: Vec<Arc<DeviceProfile>>,
}

impl StaticProfileCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile
    pub fn register(&mut self, profile: DeviceProfile) {
        self.profiles.push(Arc::new(profile));
    }

    /// Number of registered profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileResolver for StaticProfileCatalog {
    fn resolve(&self, device: &DeviceRecord) -> Option<Arc<DeviceProfile>> {
        let manufacturer = device.manufacturer.as_deref()?;
        let model = device.model.as_deref()?;
        self.profiles
            .iter()
            .find(|p| p.vendor == manufacturer && p.model == model)
            .cloned()
    }
}

/// Endpoint-name vocabulary for attribute-key suffixes
pub mod endpoint_names {
    /// Names recognized as endpoint qualifiers on attribute keys, longest
    /// first so compound names win over their components.
    pub const ENDPOINT_NAMES: &[&str] = &[
        "bottom_left",
        "bottom_right",
        "center_left",
        "center_right",
        "top_left",
        "top_right",
        "bottom",
        "center",
        "system",
        "white",
        "left",
        "right",
        "top",
        "rgb",
    ];

    /// Split an endpoint-qualifying suffix off an attribute key
    ///
    /// `state_bottom_left` becomes `("state", Some("bottom_left"))`;
    /// a key without a recognized suffix is returned unchanged.
    pub fn split_endpoint_suffix(key: &str) -> (&str, Option<&str>) {
        for name in ENDPOINT_NAMES {
            if let Some(base) = key.strip_suffix(name) {
                if let Some(base) = base.strip_suffix('_') {
                    if !base.is_empty() {
                        return (base, Some(name));
                    }
                }
            }
        }
        (key, None)
    }
}
