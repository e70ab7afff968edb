//! Testing utilities: mock network controller and fixture profiles
//!
//! Shared between the crate's unit tests and the integration suite. The
//! fixtures model a small but realistic slice of a vendor catalog: an
//! on/off switch, a dimmable color light, a multi-gang switch with named
//! endpoints, and a report-only climate sensor with a commissioning
//! routine.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hivelink_core::{
    CommandSink, ConfigureRoutine, ConvertContext, Converter, CoreError, DeviceId, DeviceProfile,
    DeviceRecord, IncomingMessage, InterviewState, MessageKind, SetOutcome, StateMap,
    StaticProfileCatalog,
};

use crate::network::NetworkController;

// ============================================================================
// Mock network controller
// ============================================================================

/// One command captured by the mock network
#[derive(Debug, Clone)]
pub struct SentCommand {
    /// Target device
    pub device: DeviceId,
    /// Target endpoint
    pub endpoint: u8,
    /// Cluster the command was sent on
    pub cluster: String,
    /// Transaction sequence number
    pub sequence: u8,
    /// Command payload
    pub payload: Value,
}

/// In-memory network controller recording every sent command
#[derive(Default)]
pub struct MockNetwork {
    sent: Mutex<Vec<SentCommand>>,
    sequence: AtomicU8,
    failing: AtomicBool,
}

impl MockNetwork {
    /// Create a mock with sequence numbers starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands sent so far
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    /// Number of commands sent so far
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Make every subsequent send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandSink for MockNetwork {
    async fn send_command(
        &self,
        device: &DeviceId,
        endpoint: u8,
        cluster: &str,
        sequence: u8,
        payload: Value,
    ) -> hivelink_core::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Network("mock send failure".to_string()));
        }
        self.sent.lock().push(SentCommand {
            device: device.clone(),
            endpoint,
            cluster: cluster.to_string(),
            sequence,
            payload,
        });
        Ok(())
    }
}

impl NetworkController for MockNetwork {
    fn coordinator_endpoint(&self) -> u8 {
        1
    }

    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

// ============================================================================
// Fixture converters
// ============================================================================

/// On/off converter over `genOnOff`
#[derive(Default)]
pub struct OnOffConverter {
    set_calls: AtomicU32,
}

impl OnOffConverter {
    /// Times the set handler ran
    pub fn set_calls(&self) -> u32 {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for OnOffConverter {
    fn keys(&self) -> &[&str] {
        &["state"]
    }

    fn cluster(&self) -> &str {
        "genOnOff"
    }

    fn can_set(&self) -> bool {
        true
    }

    fn can_get(&self) -> bool {
        true
    }

    async fn encode_set(
        &self,
        ctx: &ConvertContext<'_>,
        key: &str,
        value: &Value,
    ) -> hivelink_core::Result<SetOutcome> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let command = value
            .as_str()
            .filter(|s| s.eq_ignore_ascii_case("on") || s.eq_ignore_ascii_case("off"))
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| CoreError::invalid_value(key, "expected \"ON\" or \"OFF\""))?;

        ctx.sink
            .send_command(
                &ctx.device.id,
                ctx.endpoint,
                self.cluster(),
                ctx.sequence,
                json!({ "command": command }),
            )
            .await?;

        let mut state = StateMap::new();
        state.insert("state", command.to_ascii_uppercase());
        Ok(SetOutcome::state(state))
    }

    async fn encode_get(&self, ctx: &ConvertContext<'_>, _key: &str) -> hivelink_core::Result<()> {
        ctx.sink
            .send_command(
                &ctx.device.id,
                ctx.endpoint,
                self.cluster(),
                ctx.sequence,
                json!({ "read": ["onOff"] }),
            )
            .await
    }

    fn decode(
        &self,
        _device: &DeviceRecord,
        message: &IncomingMessage,
    ) -> hivelink_core::Result<StateMap> {
        let mut state = StateMap::new();
        if let Some(on) = message.payload.get("onOff").and_then(Value::as_u64) {
            state.insert("state", if on == 1 { "ON" } else { "OFF" });
        }
        Ok(state)
    }
}

/// Brightness converter over `genLevelCtrl`, optionally asking for a
/// read-after-write reconciliation
#[derive(Default)]
pub struct BrightnessConverter {
    read_after: Option<Duration>,
}

impl BrightnessConverter {
    /// Converter requesting a re-read after the given delay
    pub fn with_read_after(delay: Duration) -> Self {
        Self {
            read_after: Some(delay),
        }
    }
}

#[async_trait]
impl Converter for BrightnessConverter {
    fn keys(&self) -> &[&str] {
        &["brightness"]
    }

    fn cluster(&self) -> &str {
        "genLevelCtrl"
    }

    fn can_set(&self) -> bool {
        true
    }

    fn can_get(&self) -> bool {
        true
    }

    async fn encode_set(
        &self,
        ctx: &ConvertContext<'_>,
        key: &str,
        value: &Value,
    ) -> hivelink_core::Result<SetOutcome> {
        let level = value
            .as_u64()
            .filter(|l| *l <= 254)
            .ok_or_else(|| CoreError::invalid_value(key, "expected 0..=254"))?;

        ctx.sink
            .send_command(
                &ctx.device.id,
                ctx.endpoint,
                self.cluster(),
                ctx.sequence,
                json!({ "command": "moveToLevel", "level": level }),
            )
            .await?;

        let mut state = StateMap::new();
        state.insert("brightness", level);
        let outcome = SetOutcome::state(state);
        Ok(match self.read_after {
            Some(delay) => outcome.with_read_after(delay),
            None => outcome,
        })
    }

    async fn encode_get(&self, ctx: &ConvertContext<'_>, _key: &str) -> hivelink_core::Result<()> {
        ctx.sink
            .send_command(
                &ctx.device.id,
                ctx.endpoint,
                self.cluster(),
                ctx.sequence,
                json!({ "read": ["currentLevel"] }),
            )
            .await
    }

    fn decode(
        &self,
        _device: &DeviceRecord,
        message: &IncomingMessage,
    ) -> hivelink_core::Result<StateMap> {
        let mut state = StateMap::new();
        if let Some(level) = message.payload.get("currentLevel").and_then(Value::as_u64) {
            state.insert("brightness", level);
        }
        Ok(state)
    }
}

/// Color converter serving both `hue` and `saturation` in one invocation
#[derive(Default)]
pub struct ColorConverter {
    set_calls: AtomicU32,
}

impl ColorConverter {
    /// Times the set handler ran
    pub fn set_calls(&self) -> u32 {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for ColorConverter {
    fn keys(&self) -> &[&str] {
        &["hue", "saturation"]
    }

    fn cluster(&self) -> &str {
        "lightingColorCtrl"
    }

    fn can_set(&self) -> bool {
        true
    }

    async fn encode_set(
        &self,
        ctx: &ConvertContext<'_>,
        key: &str,
        value: &Value,
    ) -> hivelink_core::Result<SetOutcome> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);

        // Sibling values come from the full request map.
        let hue = ctx.request.get("hue").or(if key == "hue" { Some(value) } else { None });
        let saturation = ctx
            .request
            .get("saturation")
            .or(if key == "saturation" { Some(value) } else { None });

        ctx.sink
            .send_command(
                &ctx.device.id,
                ctx.endpoint,
                self.cluster(),
                ctx.sequence,
                json!({
                    "command": "moveToHueAndSaturation",
                    "hue": hue,
                    "saturation": saturation,
                }),
            )
            .await?;

        let mut state = StateMap::new();
        if let Some(hue) = hue {
            state.insert("hue", hue.clone());
        }
        if let Some(saturation) = saturation {
            state.insert("saturation", saturation.clone());
        }
        Ok(SetOutcome::state(state))
    }
}

/// Report-only temperature converter over `msTemperatureMeasurement`
#[derive(Default)]
pub struct TemperatureConverter;

#[async_trait]
impl Converter for TemperatureConverter {
    fn keys(&self) -> &[&str] {
        &["temperature"]
    }

    fn cluster(&self) -> &str {
        "msTemperatureMeasurement"
    }

    fn message_kinds(&self) -> &[MessageKind] {
        &[MessageKind::AttributeReport]
    }

    fn decode(
        &self,
        _device: &DeviceRecord,
        message: &IncomingMessage,
    ) -> hivelink_core::Result<StateMap> {
        let mut state = StateMap::new();
        if let Some(raw) = message.payload.get("measuredValue").and_then(Value::as_i64) {
            state.insert("temperature", raw as f64 / 100.0);
        }
        Ok(state)
    }
}

// ============================================================================
// Fixture configure routine
// ============================================================================

/// Configure routine that can be told to fail its first N runs
#[derive(Default)]
pub struct CountingConfigure {
    runs: AtomicU32,
    fail_remaining: AtomicU32,
    delay: Option<Duration>,
}

impl CountingConfigure {
    /// Routine that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine whose first `n` runs fail
    pub fn failing(n: u32) -> Self {
        Self {
            runs: AtomicU32::new(0),
            fail_remaining: AtomicU32::new(n),
            delay: None,
        }
    }

    /// Add an artificial delay to each run
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Times the routine ran
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigureRoutine for CountingConfigure {
    async fn run(
        &self,
        device: &DeviceRecord,
        coordinator_endpoint: u8,
        sink: &dyn CommandSink,
    ) -> hivelink_core::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::Network("bind request lost".to_string()));
        }

        sink.send_command(
            &device.id,
            device.default_endpoint().unwrap_or(1),
            "genBasic",
            0,
            json!({ "bind": { "source": coordinator_endpoint } }),
        )
        .await
    }
}

// ============================================================================
// Fixture profiles and devices
// ============================================================================

/// Dimmable color light: on/off + brightness + hue/saturation
pub fn light_profile() -> DeviceProfile {
    let mut profile = DeviceProfile::new("Lumora", "LM-100", "Dimmable color bulb");
    profile.converters.push(Arc::new(OnOffConverter::default()));
    profile
        .converters
        .push(Arc::new(BrightnessConverter::default()));
    profile.converters.push(Arc::new(ColorConverter::default()));
    profile
}

/// Two-gang switch with `left`/`right` endpoints
pub fn two_gang_profile() -> DeviceProfile {
    let mut profile = DeviceProfile::new("Lumora", "LM-2G", "2-gang wall switch");
    profile.converters.push(Arc::new(OnOffConverter::default()));
    profile.endpoints.insert("left".to_string(), 1);
    profile.endpoints.insert("right".to_string(), 2);
    profile
}

/// Report-only climate sensor with a commissioning routine
pub fn climate_profile(configure: Arc<dyn ConfigureRoutine>) -> DeviceProfile {
    let mut profile = DeviceProfile::new("Lumora", "LM-TH", "Temperature sensor");
    profile.converters.push(Arc::new(TemperatureConverter));
    profile.configure = Some(configure);
    profile.configure_version = 1;
    profile
}

/// Fully interviewed device matching a profile's vendor/model
pub fn device(id: &str, model: &str, endpoints: &[u8]) -> DeviceRecord {
    let mut record = DeviceRecord::new(id, 0x1234);
    record.manufacturer = Some("Lumora".to_string());
    record.model = Some(model.to_string());
    record.endpoints = endpoints.to_vec();
    record.interview = InterviewState::Successful;
    record
}

/// Catalog holding the given profiles
pub fn catalog(profiles: Vec<DeviceProfile>) -> Arc<StaticProfileCatalog> {
    let mut catalog = StaticProfileCatalog::new();
    for profile in profiles {
        catalog.register(profile);
    }
    Arc::new(catalog)
}
