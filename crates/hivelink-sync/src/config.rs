//! Configuration for the synchronization engine
//!
//! Tuning knobs for response correlation, pending-key collision handling,
//! and device commissioning retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default response timeout for pending requests
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Default cap on commissioning attempts per device
pub const DEFAULT_MAX_CONFIGURE_ATTEMPTS: u32 = 3;

/// Default capacity of the state-update channel
pub const DEFAULT_UPDATE_QUEUE_SIZE: usize = 256;

/// Minimum honored read-after-write delay
pub const MIN_READ_AFTER_MS: u64 = 50;

/// What to do when a pending key is enqueued twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Last write wins; the displaced waiter is rejected with
    /// `DuplicateKey` and a warning is logged
    #[default]
    Overwrite,
    /// The new enqueue fails with `DuplicateKey`
    Strict,
}

/// Main configuration for the synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a pending request may wait for its response; also the
    /// eviction sweep interval
    #[serde(with = "humantime_serde", default = "default_response_timeout")]
    pub response_timeout: Duration,

    /// Pending-key collision handling
    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    /// Commissioning attempts allowed per device before giving up
    #[serde(default = "default_max_configure_attempts")]
    pub max_configure_attempts: u32,

    /// Propagate commissioning failures to the caller instead of logging
    #[serde(default)]
    pub strict_configure_errors: bool,

    /// Capacity of the state-update channel to the accessory layer
    #[serde(default = "default_update_queue_size")]
    pub update_queue_size: usize,

    /// Floor applied to converter-recommended read-after-write delays
    #[serde(with = "humantime_serde", default = "default_read_after_floor")]
    pub read_after_floor: Duration,
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS)
}

fn default_max_configure_attempts() -> u32 {
    DEFAULT_MAX_CONFIGURE_ATTEMPTS
}

fn default_update_queue_size() -> usize {
    DEFAULT_UPDATE_QUEUE_SIZE
}

fn default_read_after_floor() -> Duration {
    Duration::from_millis(MIN_READ_AFTER_MS)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            response_timeout: default_response_timeout(),
            collision_policy: CollisionPolicy::default(),
            max_configure_attempts: DEFAULT_MAX_CONFIGURE_ATTEMPTS,
            strict_configure_errors: false,
            update_queue_size: DEFAULT_UPDATE_QUEUE_SIZE,
            read_after_floor: default_read_after_floor(),
        }
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response timeout (and sweep interval)
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the pending-key collision policy
    pub fn collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.config.collision_policy = policy;
        self
    }

    /// Set the commissioning attempt cap
    pub fn max_configure_attempts(mut self, attempts: u32) -> Self {
        self.config.max_configure_attempts = attempts;
        self
    }

    /// Enable or disable strict commissioning error propagation
    pub fn strict_configure_errors(mut self, strict: bool) -> Self {
        self.config.strict_configure_errors = strict;
        self
    }

    /// Set the state-update channel capacity
    pub fn update_queue_size(mut self, size: usize) -> Self {
        self.config.update_queue_size = size.max(1);
        self
    }

    /// Set the floor for converter-recommended read-after-write delays
    pub fn read_after_floor(mut self, floor: Duration) -> Self {
        self.config.read_after_floor = floor;
        self
    }

    /// Build the configuration
    pub fn build(self) -> SyncConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
