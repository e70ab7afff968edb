//! Device commissioning controller
//!
//! Many devices need a one-time configuration pass (reporting bindings,
//! interval writes) before they behave. The link is unreliable, so the
//! controller serializes and bounds those attempts: at most one in flight
//! per device, a capped retry count, and idempotent re-entry keyed off the
//! configuration-version marker persisted on the device record.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use hivelink_core::{DeviceId, DeviceProfile, DeviceRecord};

use crate::engine::DeviceHandle;
use crate::error::{Result, SyncError};
use crate::network::NetworkController;

/// Per-device commissioning bookkeeping
///
/// Created lazily on first touch; attempts start at zero explicitly.
#[derive(Debug, Default)]
struct ConfigRecord {
    attempts: u32,
    in_progress: bool,
}

/// Counters for monitoring commissioning
#[derive(Debug, Clone, Default)]
pub struct ConfigureStats {
    /// Routines started
    pub attempts: u64,
    /// Routines completed successfully
    pub successes: u64,
    /// Routines that failed
    pub failures: u64,
    /// Calls refused (in progress or attempt cap)
    pub refused: u64,
}

/// Serializes and bounds per-device configuration attempts
pub struct ConfigurationController {
    records: Mutex<HashMap<DeviceId, ConfigRecord>>,
    network: Arc<dyn NetworkController>,
    max_attempts: u32,
    strict_errors: bool,
    stats: Mutex<ConfigureStats>,
}

impl ConfigurationController {
    /// Create a controller bound to a network controller
    pub fn new(network: Arc<dyn NetworkController>, max_attempts: u32, strict_errors: bool) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            network,
            max_attempts,
            strict_errors,
            stats: Mutex::new(ConfigureStats::default()),
        }
    }

    /// Whether a device is currently eligible for commissioning
    ///
    /// False when the profile declares no routine, when the persisted
    /// marker already matches the profile's configuration version, or when
    /// the device is still mid-interview.
    pub fn should_configure(&self, record: &DeviceRecord, profile: &DeviceProfile) -> bool {
        if profile.configure.is_none() {
            return false;
        }
        if record.configured_marker() == Some(profile.configure_version) {
            return false;
        }
        record.interview.is_complete()
    }

    /// Run the profile's commissioning routine for a device
    ///
    /// Returns `Ok(false)` without side effects when the persisted marker
    /// already matches the profile's version, when an attempt is already
    /// in flight, or when the attempt cap is reached and `force` is not
    /// set. On success the configuration-version marker is persisted on
    /// the device record. On failure the attempt is counted and, unless
    /// strict error propagation was requested, recovered with a log line.
    /// The in-flight flag is released on every exit path.
    pub async fn configure(&self, device: &Arc<DeviceHandle>, force: bool) -> Result<bool> {
        let profile = device.profile()?;
        let Some(routine) = profile.configure.clone() else {
            return Ok(false);
        };
        let record = device.record.read().clone();

        if !force && record.configured_marker() == Some(profile.configure_version) {
            debug!(device = %record.id, "Device already configured");
            return Ok(false);
        }

        // Admission: mutual exclusion and attempt cap, under one lock.
        let attempt = {
            let mut records = self.records.lock();
            let entry = records.entry(record.id.clone()).or_default();
            if entry.in_progress {
                debug!(device = %record.id, "Configuration already in progress");
                self.stats.lock().refused += 1;
                return Ok(false);
            }
            if entry.attempts >= self.max_attempts && !force {
                debug!(
                    device = %record.id,
                    attempts = entry.attempts,
                    "Configuration attempt cap reached"
                );
                self.stats.lock().refused += 1;
                return Ok(false);
            }
            entry.in_progress = true;
            entry.attempts + 1
        };
        self.stats.lock().attempts += 1;

        debug!(device = %record.id, attempt, "Configuring device");
        let outcome = routine
            .run(&record, self.network.coordinator_endpoint(), &*self.network)
            .await;

        match outcome {
            Ok(()) => {
                device
                    .record
                    .write()
                    .set_configured_marker(profile.configure_version);
                self.release(&record.id, false);
                self.stats.lock().successes += 1;
                info!(
                    device = %record.id,
                    version = profile.configure_version,
                    "Device configured"
                );
                Ok(true)
            }
            Err(err) => {
                self.release(&record.id, true);
                self.stats.lock().failures += 1;
                warn!(
                    device = %record.id,
                    attempt,
                    error = %err,
                    "Device configuration failed"
                );
                if self.strict_errors {
                    Err(SyncError::ConfigurationFailed {
                        device: record.id.to_string(),
                        attempt,
                        reason: err.to_string(),
                    })
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Drop bookkeeping for a removed device
    pub fn forget(&self, device: &DeviceId) {
        self.records.lock().remove(device);
    }

    /// Failed attempts recorded for a device
    pub fn attempts(&self, device: &DeviceId) -> u32 {
        self.records
            .lock()
            .get(device)
            .map(|r| r.attempts)
            .unwrap_or(0)
    }

    /// Snapshot of commissioning counters
    pub fn stats(&self) -> ConfigureStats {
        self.stats.lock().clone()
    }

    fn release(&self, device: &DeviceId, failed: bool) {
        let mut records = self.records.lock();
        let entry = records.entry(device.clone()).or_default();
        entry.in_progress = false;
        if failed {
            entry.attempts += 1;
        }
    }
}
