//! Converter resolution pipeline
//!
//! Translates a generic attribute/value map into encode (set) or decode
//! (get) invocations against the right endpoint and converter:
//!
//! 1. Order attributes so power-family keys run first when the device is
//!    being switched off and last otherwise — firmwares commonly reject
//!    non-power writes while off and redundant power toggles while on.
//! 2. Resolve the target endpoint from an endpoint-name suffix on the key.
//! 3. Resolve the converter by declared key.
//! 4. Invoke each converter at most once per (endpoint, operation).
//! 5. Merge results into the device's cached state; schedule
//!    read-after-write reconciliation when the converter asks for it.
//!
//! A single attribute's failure is logged and skipped; only the total
//! absence of a device profile fails a whole call.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use hivelink_core::{
    endpoint_names, ConvertContext, DeviceProfile, DeviceRecord, IncomingMessage, StateMap,
    StateUpdate,
};

use crate::engine::DeviceHandle;
use crate::error::{Result, SyncError};
use crate::network::NetworkController;
use crate::pending::{PendingKey, PendingRequestTable};

/// Keys whose processing position depends on the power state
const POWER_FAMILY_KEYS: &[&str] = &["state", "brightness", "brightness_percent", "on_time"];

/// Counters for monitoring the pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Encode invocations that succeeded
    pub sets_applied: u64,
    /// Read requests issued
    pub gets_issued: u64,
    /// Unsolicited frames decoded
    pub reports_handled: u64,
    /// Attributes skipped (unknown endpoint, no converter, capability)
    pub attributes_skipped: u64,
    /// Converter handler failures recovered locally
    pub converter_errors: u64,
    /// State updates emitted to the accessory layer
    pub updates_emitted: u64,
    /// Read-after-write reconciliations scheduled
    pub reads_scheduled: u64,
}

/// Resolves converters and drives encode/decode for one engine instance
pub struct ConverterPipeline {
    pending: Arc<PendingRequestTable>,
    network: Arc<dyn NetworkController>,
    updates: mpsc::Sender<StateUpdate>,
    read_after_floor: Duration,
    stats: Mutex<PipelineStats>,
}

impl ConverterPipeline {
    /// Create a pipeline bound to a pending table and network controller
    pub fn new(
        pending: Arc<PendingRequestTable>,
        network: Arc<dyn NetworkController>,
        updates: mpsc::Sender<StateUpdate>,
        read_after_floor: Duration,
    ) -> Self {
        Self {
            pending,
            network,
            updates,
            read_after_floor,
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    /// Order attributes by the power-state policy
    ///
    /// With a power state of `"off"` in the map, power-family keys move to
    /// the front and the switch keys lead them, so `state` is written
    /// before `brightness`; otherwise the group moves to the back with the
    /// switch keys trailing, so `brightness` is written before `state`.
    pub fn order_attributes(attributes: &StateMap) -> Vec<(String, Value)> {
        let powering_off = attributes.iter().any(|(key, value)| {
            let (base, _) = endpoint_names::split_endpoint_suffix(key);
            base == "state" && value.as_str().is_some_and(|s| s.eq_ignore_ascii_case("off"))
        });

        let (power, rest): (Vec<_>, Vec<_>) = attributes
            .clone()
            .into_iter()
            .partition(|(key, _)| Self::is_power_family(key));
        let (switch, level): (Vec<_>, Vec<_>) = power.into_iter().partition(|(key, _)| {
            let (base, _) = endpoint_names::split_endpoint_suffix(key);
            base == "state"
        });

        let mut ordered = Vec::with_capacity(attributes.len());
        if powering_off {
            ordered.extend(switch);
            ordered.extend(level);
            ordered.extend(rest);
        } else {
            ordered.extend(rest);
            ordered.extend(level);
            ordered.extend(switch);
        }
        ordered
    }

    fn is_power_family(key: &str) -> bool {
        let (base, _) = endpoint_names::split_endpoint_suffix(key);
        POWER_FAMILY_KEYS.contains(&base)
    }

    /// Resolve the target endpoint for an attribute key
    ///
    /// An endpoint-name suffix must resolve through the profile's declared
    /// endpoints and exist on the device; an unqualified key targets the
    /// device's default endpoint.
    fn resolve_endpoint<'k>(
        record: &DeviceRecord,
        profile: &DeviceProfile,
        key: &'k str,
    ) -> Result<(&'k str, u8)> {
        let (base, suffix) = endpoint_names::split_endpoint_suffix(key);
        match suffix {
            Some(name) => match profile.endpoint_id(name) {
                Some(id) if record.has_endpoint(id) => Ok((base, id)),
                _ => Err(SyncError::UnknownEndpoint {
                    name: name.to_string(),
                    device: record.id.to_string(),
                }),
            },
            None => record
                .default_endpoint()
                .map(|id| (base, id))
                .ok_or_else(|| SyncError::UnknownEndpoint {
                    name: "default".to_string(),
                    device: record.id.to_string(),
                }),
        }
    }

    /// Encode path: translate attributes into wire commands
    ///
    /// Returns the device's cached state after merging every successful
    /// converter result. Skipped attributes are logged, never fatal.
    pub async fn apply_set(
        self: &Arc<Self>,
        device: &Arc<DeviceHandle>,
        attributes: &StateMap,
        options: &StateMap,
    ) -> Result<StateMap> {
        let profile = device.profile()?;
        let record = device.record.read().clone();
        let mut used: HashSet<(u8, usize)> = HashSet::new();

        for (key, value) in Self::order_attributes(attributes) {
            let (base, endpoint) = match Self::resolve_endpoint(&record, &profile, &key) {
                Ok(target) => target,
                Err(err) => {
                    warn!(device = %record.id, key = %key, error = %err, "Skipping attribute");
                    self.stats.lock().attributes_skipped += 1;
                    continue;
                }
            };

            let Some((index, converter)) = profile.converter_for_key(base) else {
                let err = SyncError::NoConverter(base.to_string());
                warn!(device = %record.id, key = %key, error = %err, "Skipping attribute");
                self.stats.lock().attributes_skipped += 1;
                continue;
            };
            if !converter.can_set() {
                warn!(device = %record.id, key = %key, "Converter cannot set, skipping");
                self.stats.lock().attributes_skipped += 1;
                continue;
            }
            if !used.insert((endpoint, index)) {
                trace!(device = %record.id, key = %key, endpoint, "Converter already invoked for endpoint");
                continue;
            }

            let sequence = self.network.next_sequence();
            let state_snapshot = device.state.lock().clone();
            let ctx = ConvertContext {
                device: &record,
                endpoint,
                state: &state_snapshot,
                request: attributes,
                options,
                sequence,
                sink: &*self.network,
            };

            match converter.encode_set(&ctx, base, &value).await {
                Ok(outcome) => {
                    trace!(device = %record.id, key = %key, endpoint, "Attribute written");
                    self.stats.lock().sets_applied += 1;
                    device.state.lock().merge(outcome.state);
                    if let Some(delay) = outcome.read_after {
                        self.schedule_read_after(device, key.clone(), delay);
                    }
                }
                Err(err) => {
                    warn!(device = %record.id, key = %key, error = %err, "Converter set failed, skipping");
                    self.stats.lock().converter_errors += 1;
                }
            }
        }

        Ok(device.state.lock().clone())
    }

    /// Decode path: issue reads and wait for the correlated responses
    ///
    /// Fails with `NoResponse` when nothing answers within the response
    /// timeout; partial batches are merged and logged.
    pub async fn apply_get(
        self: &Arc<Self>,
        device: &Arc<DeviceHandle>,
        attributes: &StateMap,
        options: &StateMap,
    ) -> Result<StateMap> {
        let profile = device.profile()?;
        let record = device.record.read().clone();
        let mut used: HashSet<(u8, usize)> = HashSet::new();
        let mut futures = Vec::new();

        for (key, _) in Self::order_attributes(attributes) {
            let (base, endpoint) = match Self::resolve_endpoint(&record, &profile, &key) {
                Ok(target) => target,
                Err(err) => {
                    warn!(device = %record.id, key = %key, error = %err, "Skipping attribute");
                    self.stats.lock().attributes_skipped += 1;
                    continue;
                }
            };

            let Some((index, converter)) = profile.converter_for_key(base) else {
                let err = SyncError::NoConverter(base.to_string());
                warn!(device = %record.id, key = %key, error = %err, "Skipping attribute");
                self.stats.lock().attributes_skipped += 1;
                continue;
            };
            if !converter.can_get() {
                warn!(device = %record.id, key = %key, "Converter cannot get, skipping");
                self.stats.lock().attributes_skipped += 1;
                continue;
            }
            if !used.insert((endpoint, index)) {
                trace!(device = %record.id, key = %key, endpoint, "Converter already invoked for endpoint");
                continue;
            }

            // Register the pending entry before the command leaves, so a
            // fast response cannot race an unregistered key.
            let sequence = self.network.next_sequence();
            let pending_key = PendingKey::new(record.id.clone(), endpoint, sequence);
            let future = match self.pending.enqueue(pending_key.clone()) {
                Ok(future) => future,
                Err(err) => {
                    warn!(device = %record.id, key = %key, error = %err, "Could not register pending read");
                    continue;
                }
            };

            let state_snapshot = device.state.lock().clone();
            let ctx = ConvertContext {
                device: &record,
                endpoint,
                state: &state_snapshot,
                request: attributes,
                options,
                sequence,
                sink: &*self.network,
            };

            match converter.encode_get(&ctx, base).await {
                Ok(()) => {
                    self.stats.lock().gets_issued += 1;
                    futures.push(future);
                }
                Err(err) => {
                    warn!(device = %record.id, key = %key, error = %err, "Converter get failed, skipping");
                    self.stats.lock().converter_errors += 1;
                    self.pending.cancel(&pending_key);
                }
            }
        }

        if futures.is_empty() {
            return Err(SyncError::NoResponse(record.id.to_string()));
        }

        let outcome = PendingRequestTable::wait_all(futures).await;
        if outcome.is_empty() {
            return Err(SyncError::NoResponse(record.id.to_string()));
        }
        if !outcome.failures.is_empty() {
            warn!(
                device = %record.id,
                responded = outcome.responses.len(),
                timed_out = outcome.timed_out(),
                "Partial read batch"
            );
        }

        for message in &outcome.responses {
            let delta = self.decode_message(&record, &profile, message);
            device.state.lock().merge(delta);
        }

        Ok(device.state.lock().clone())
    }

    /// Report path: decode an unsolicited frame and emit one state update
    pub async fn handle_report(
        &self,
        device: &Arc<DeviceHandle>,
        message: &IncomingMessage,
    ) -> Result<()> {
        let profile = device.profile()?;
        let record = device.record.read().clone();

        let matching = profile.converters_for_message(message);
        if matching.is_empty() {
            if message.kind.is_diagnostic() {
                trace!(device = %record.id, kind = %message.kind, "Ignoring diagnostic frame");
            } else {
                debug!(
                    device = %record.id,
                    cluster = %message.cluster,
                    kind = %message.kind,
                    "No converter for incoming frame, dropping"
                );
            }
            return Ok(());
        }

        let mut delta = StateMap::new();
        for (_, converter) in matching {
            match converter.decode(&record, message) {
                Ok(part) => delta.merge(part),
                Err(err) => {
                    warn!(device = %record.id, cluster = %message.cluster, error = %err, "Converter decode failed");
                    self.stats.lock().converter_errors += 1;
                }
            }
        }
        self.stats.lock().reports_handled += 1;

        if delta.is_empty() {
            return Ok(());
        }

        device.state.lock().merge(delta.clone());
        self.updates
            .send(StateUpdate {
                device: record.id.clone(),
                delta,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        self.stats.lock().updates_emitted += 1;
        Ok(())
    }

    /// Decode a solicited response through the profile's matching converters
    fn decode_message(
        &self,
        record: &DeviceRecord,
        profile: &DeviceProfile,
        message: &IncomingMessage,
    ) -> StateMap {
        let mut delta = StateMap::new();
        for (_, converter) in profile.converters_for_message(message) {
            match converter.decode(record, message) {
                Ok(part) => delta.merge(part),
                Err(err) => {
                    warn!(device = %record.id, cluster = %message.cluster, error = %err, "Converter decode failed");
                    self.stats.lock().converter_errors += 1;
                }
            }
        }
        delta
    }

    /// Schedule a fire-and-forget re-read of one attribute
    ///
    /// Reconciles state a firmware applies asynchronously and never
    /// reports. Failures are logged at debug level and never surface to
    /// the originating set call.
    fn schedule_read_after(self: &Arc<Self>, device: &Arc<DeviceHandle>, key: String, delay: Duration) {
        let delay = delay.max(self.read_after_floor);
        let pipeline = Arc::clone(self);
        let device = Arc::clone(device);
        self.stats.lock().reads_scheduled += 1;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut attributes = StateMap::new();
            attributes.insert(key.clone(), Value::Null);
            if let Err(err) = pipeline.apply_get(&device, &attributes, &StateMap::new()).await {
                debug!(key = %key, error = %err, "Read-after-write reconciliation failed");
            }
        });
    }

    /// Snapshot of pipeline counters
    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(entries: &[(&str, Value)]) -> StateMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_ordering_power_off_first() {
        let ordered = ConverterPipeline::order_attributes(&attrs(&[
            ("color_temp", json!(370)),
            ("state", json!("off")),
            ("brightness", json!(50)),
        ]));
        let keys: Vec<&str> = ordered.iter().map(|(k, _)| k.as_str()).collect();

        let state_pos = keys.iter().position(|k| *k == "state").unwrap();
        let brightness_pos = keys.iter().position(|k| *k == "brightness").unwrap();
        let color_pos = keys.iter().position(|k| *k == "color_temp").unwrap();
        assert!(state_pos < color_pos);
        assert!(brightness_pos < color_pos);
    }

    #[test]
    fn test_ordering_power_on_last() {
        let ordered = ConverterPipeline::order_attributes(&attrs(&[
            ("state", json!("on")),
            ("brightness", json!(50)),
            ("color_temp", json!(370)),
        ]));
        let keys: Vec<&str> = ordered.iter().map(|(k, _)| k.as_str()).collect();

        let state_pos = keys.iter().position(|k| *k == "state").unwrap();
        let color_pos = keys.iter().position(|k| *k == "color_temp").unwrap();
        assert!(color_pos < state_pos);
    }

    #[test]
    fn test_state_precedes_brightness_when_powering_off() {
        // Fresh maps each round so hash-order luck cannot mask a regression
        for _ in 0..16 {
            let ordered = ConverterPipeline::order_attributes(&attrs(&[
                ("state", json!("off")),
                ("brightness", json!(50)),
            ]));
            let keys: Vec<&str> = ordered.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["state", "brightness"]);
        }
    }

    #[test]
    fn test_brightness_precedes_state_when_powering_on() {
        for _ in 0..16 {
            let ordered = ConverterPipeline::order_attributes(&attrs(&[
                ("state", json!("on")),
                ("brightness", json!(50)),
            ]));
            let keys: Vec<&str> = ordered.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["brightness", "state"]);
        }
    }

    #[test]
    fn test_ordering_case_insensitive_off() {
        let ordered = ConverterPipeline::order_attributes(&attrs(&[
            ("color_temp", json!(370)),
            ("state", json!("OFF")),
        ]));
        assert_eq!(ordered[0].0, "state");
    }

    #[test]
    fn test_ordering_endpoint_qualified_state() {
        let ordered = ConverterPipeline::order_attributes(&attrs(&[
            ("color_temp", json!(370)),
            ("state_left", json!("off")),
        ]));
        assert_eq!(ordered[0].0, "state_left");
    }

    #[test]
    fn test_power_family_classification() {
        assert!(ConverterPipeline::is_power_family("state"));
        assert!(ConverterPipeline::is_power_family("brightness_left"));
        assert!(!ConverterPipeline::is_power_family("color_temp"));
    }
}
