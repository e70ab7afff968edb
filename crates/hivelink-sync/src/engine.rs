//! SyncEngine - composition root of the synchronization engine
//!
//! Owns the pending-request table, the per-device cached state, the
//! converter pipeline, and the configuration controller, and exposes the
//! facade the accessory layer calls:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                             │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌───────────────┐   ┌────────────────────┐   ┌────────────┐   │
//! │  │ Accessory API │──►│ ConverterPipeline  │──►│ Network    │   │
//! │  │ set/get state │   │                    │   │ Controller │   │
//! │  └───────────────┘   │ PendingRequestTable│   └────────────┘   │
//! │                      │ Configuration-     │                    │
//! │  StateUpdate rx ◄────│ Controller         │◄── incoming frames │
//! │                      └────────────────────┘                    │
//! │                                                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every instance is self-contained: constructed per session, flushed and
//! torn down on shutdown, no ambient globals.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hivelink_core::{
    DeviceId, DeviceProfile, DeviceRecord, IncomingMessage, ProfileResolver, StateMap, StateUpdate,
};

use crate::config::SyncConfig;
use crate::configure::{ConfigurationController, ConfigureStats};
use crate::error::{FlushReason, Result, SyncError};
use crate::network::NetworkController;
use crate::pending::{PendingKey, PendingRequestTable, PendingStats};
use crate::pipeline::{ConverterPipeline, PipelineStats};

/// One registered device: its record, resolved profile, and cached state
///
/// All mutation flows through the engine's serialized paths, so the locks
/// here are held only for short copies and merges.
pub struct DeviceHandle {
    /// Device record, including persisted markers
    pub record: RwLock<DeviceRecord>,
    /// Profile resolved from the converter catalog, absent for
    /// unsupported hardware
    profile: Option<Arc<DeviceProfile>>,
    /// Last known attribute values
    pub state: Mutex<StateMap>,
}

impl DeviceHandle {
    /// Create a handle with an empty state cache
    pub fn new(record: DeviceRecord, profile: Option<Arc<DeviceProfile>>) -> Self {
        Self {
            record: RwLock::new(record),
            profile,
            state: Mutex::new(StateMap::new()),
        }
    }

    /// The device's profile, or `UnsupportedDevice`
    pub fn profile(&self) -> Result<Arc<DeviceProfile>> {
        match &self.profile {
            Some(profile) => Ok(Arc::clone(profile)),
            None => {
                let record = self.record.read();
                Err(SyncError::UnsupportedDevice {
                    device: record.id.to_string(),
                    detail: format!(
                        "{}/{}",
                        record.manufacturer.as_deref().unwrap_or("?"),
                        record.model.as_deref().unwrap_or("?")
                    ),
                })
            }
        }
    }

    /// Whether a profile was resolved for this device
    pub fn is_supported(&self) -> bool {
        self.profile.is_some()
    }
}

/// Combined engine counters
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Pending-request table counters
    pub pending: PendingStats,
    /// Converter pipeline counters
    pub pipeline: PipelineStats,
    /// Commissioning counters
    pub configure: ConfigureStats,
}

/// Facade synchronizing bridge-side state calls with mesh devices
pub struct SyncEngine {
    config: SyncConfig,
    resolver: Arc<dyn ProfileResolver>,
    devices: RwLock<HashMap<DeviceId, Arc<DeviceHandle>>>,
    pending: Arc<PendingRequestTable>,
    pipeline: Arc<ConverterPipeline>,
    configuration: Arc<ConfigurationController>,
}

impl SyncEngine {
    /// Create an engine and the channel the accessory layer pulls state
    /// updates from
    pub fn new(
        config: SyncConfig,
        network: Arc<dyn NetworkController>,
        resolver: Arc<dyn ProfileResolver>,
    ) -> (Self, mpsc::Receiver<StateUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(config.update_queue_size);

        let pending = Arc::new(PendingRequestTable::new(
            config.response_timeout,
            config.collision_policy,
        ));
        let pipeline = Arc::new(ConverterPipeline::new(
            Arc::clone(&pending),
            Arc::clone(&network),
            updates_tx,
            config.read_after_floor,
        ));
        let configuration = Arc::new(ConfigurationController::new(
            Arc::clone(&network),
            config.max_configure_attempts,
            config.strict_configure_errors,
        ));

        let engine = Self {
            config,
            resolver,
            devices: RwLock::new(HashMap::new()),
            pending,
            pipeline,
            configuration,
        };
        (engine, updates_rx)
    }

    /// Start background work: the eviction sweep, plus one commissioning
    /// pass over every currently eligible device
    pub fn start(&self) {
        self.pending.start_sweeper();

        let eligible: Vec<Arc<DeviceHandle>> = self
            .devices
            .read()
            .values()
            .filter(|handle| self.is_eligible(handle))
            .cloned()
            .collect();

        info!(
            devices = self.devices.read().len(),
            eligible = eligible.len(),
            "Synchronization engine started"
        );
        for handle in eligible {
            self.spawn_configure(&handle);
        }
    }

    /// Stop background work and unblock every pending waiter
    pub fn shutdown(&self) {
        self.pending.stop_sweeper();
        let flushed = self.pending.flush(FlushReason::Shutdown);
        info!(flushed, "Synchronization engine stopped");
    }

    /// Network controller lost its link; fail all in-flight requests
    pub fn on_disconnected(&self) {
        let flushed = self.pending.flush(FlushReason::Disconnected);
        warn!(flushed, "Network disconnected, flushed pending requests");
    }

    /// Register (or refresh) a device
    ///
    /// The profile is resolved through the catalog; an existing handle's
    /// cached state survives re-registration.
    pub fn add_device(&self, record: DeviceRecord) -> Arc<DeviceHandle> {
        let profile = self.resolver.resolve(&record);
        if profile.is_none() {
            warn!(
                device = %record.id,
                manufacturer = record.manufacturer.as_deref().unwrap_or("?"),
                model = record.model.as_deref().unwrap_or("?"),
                "No profile for device, state calls will be rejected"
            );
        }

        let id = record.id.clone();
        let handle = Arc::new(DeviceHandle::new(record, profile));
        let mut devices = self.devices.write();
        if let Some(previous) = devices.get(&id) {
            debug!(device = %id, "Refreshing existing device registration");
            let carried = previous.state.lock().clone();
            handle.state.lock().merge(carried);
        }
        devices.insert(id, Arc::clone(&handle));
        handle
    }

    /// Remove a device and drop its cached state and commissioning record
    pub fn remove_device(&self, device: &DeviceId) -> bool {
        self.configuration.forget(device);
        self.devices.write().remove(device).is_some()
    }

    /// Look up a registered device
    pub fn device(&self, device: &DeviceId) -> Option<Arc<DeviceHandle>> {
        self.devices.read().get(device).cloned()
    }

    /// Cached state snapshot for a device
    pub fn cached_state(&self, device: &DeviceId) -> Option<StateMap> {
        self.device(device).map(|h| h.state.lock().clone())
    }

    /// Write attributes to a device
    ///
    /// Returns the cached state after merging every successful converter
    /// result; individual attribute failures are logged and skipped.
    pub async fn set_device_state(
        &self,
        device: &DeviceId,
        attributes: StateMap,
        options: StateMap,
    ) -> Result<StateMap> {
        let handle = self.require_device(device)?;
        self.pipeline.apply_set(&handle, &attributes, &options).await
    }

    /// Read attributes from a device
    ///
    /// Fails with `NoResponse` when nothing answers within the response
    /// timeout.
    pub async fn get_device_state(
        &self,
        device: &DeviceId,
        attributes: StateMap,
        options: StateMap,
    ) -> Result<StateMap> {
        let handle = self.require_device(device)?;
        self.pipeline.apply_get(&handle, &attributes, &options).await
    }

    /// Dispatch one frame from the network controller
    ///
    /// A frame matching a pending key settles that waiter; anything else
    /// runs the unsolicited report path. Either way the device's
    /// commissioning eligibility is re-checked, because devices leaving
    /// pairing become eligible lazily.
    pub async fn on_incoming_message(&self, message: IncomingMessage) {
        let key = PendingKey::for_message(&message);
        let device = self.device(&message.device);

        if !self.pending.resolve(&key, message.clone()) {
            match &device {
                Some(handle) => {
                    if let Err(err) = self.pipeline.handle_report(handle, &message).await {
                        match err {
                            SyncError::UnsupportedDevice { .. } => {
                                debug!(device = %message.device, "Report from unsupported device")
                            }
                            err => warn!(device = %message.device, error = %err, "Report handling failed"),
                        }
                    }
                }
                None => {
                    debug!(device = %message.device, "Frame from unregistered device, dropping")
                }
            }
        }

        if let Some(handle) = device {
            if self.is_eligible(&handle) {
                self.spawn_configure(&handle);
            }
        }
    }

    /// A device joined the network
    pub async fn on_device_joined(&self, record: DeviceRecord) {
        info!(device = %record.id, "Device joined");
        let handle = self.add_device(record);
        if self.is_eligible(&handle) {
            self.spawn_configure(&handle);
        }
    }

    /// A device finished its interview; re-resolve its profile and
    /// re-check commissioning eligibility
    pub async fn on_interview_complete(&self, record: DeviceRecord) {
        info!(device = %record.id, interview = %record.interview, "Interview finished");
        let handle = self.add_device(record);
        if self.is_eligible(&handle) {
            self.spawn_configure(&handle);
        }
    }

    /// Whether a device is currently eligible for commissioning
    pub fn should_configure(&self, device: &DeviceId) -> bool {
        self.device(device)
            .map(|handle| self.is_eligible(&handle))
            .unwrap_or(false)
    }

    /// Commission a device now
    ///
    /// Returns `Ok(false)` when an attempt is already in flight or the
    /// attempt cap is reached without `force`.
    pub async fn configure(&self, device: &DeviceId, force: bool) -> Result<bool> {
        let handle = self.require_device(device)?;
        self.configuration.configure(&handle, force).await
    }

    /// Snapshot of all engine counters
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            pending: self.pending.stats(),
            pipeline: self.pipeline.stats(),
            configure: self.configuration.stats(),
        }
    }

    /// The engine's configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn require_device(&self, device: &DeviceId) -> Result<Arc<DeviceHandle>> {
        self.device(device)
            .ok_or_else(|| SyncError::UnknownDevice(device.to_string()))
    }

    fn is_eligible(&self, handle: &Arc<DeviceHandle>) -> bool {
        match handle.profile() {
            Ok(profile) => {
                let record = handle.record.read();
                self.configuration.should_configure(&record, &profile)
            }
            Err(_) => false,
        }
    }

    fn spawn_configure(&self, handle: &Arc<DeviceHandle>) {
        let controller = Arc::clone(&self.configuration);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let device = handle.record.read().id.clone();
            match controller.configure(&handle, false).await {
                Ok(true) => {}
                Ok(false) => debug!(device = %device, "Configuration attempt skipped"),
                Err(err) => warn!(device = %device, error = %err, "Configuration attempt failed"),
            }
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.pending.stop_sweeper();
    }
}
