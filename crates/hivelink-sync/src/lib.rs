//! Device Command and State Synchronization for Hivelink Bridges
//!
//! This crate keeps a home-automation bridge and a mesh of low-power
//! devices in agreement about device state. The accessory layer issues
//! logical reads and writes; the engine translates them through vendor
//! converter catalogs, correlates request/response pairs on an unreliable
//! link, folds unsolicited reports into a per-device cache, and runs
//! one-time commissioning routines with bounded retries.
//!
//! # Architecture
//!
//! The engine is built from four cooperating parts:
//!
//! 1. **SyncEngine** - facade and composition root, owns the device table
//! 2. **ConverterPipeline** - set/get/report paths through the catalog
//! 3. **PendingRequestTable** - keyed in-flight requests with timeout
//! 4. **ConfigurationController** - bounded, idempotent commissioning
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hivelink_sync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // `network` implements NetworkController over the real radio,
//!     // `catalog` is the vendor converter catalog.
//!     let (engine, mut updates) =
//!         SyncEngine::new(SyncConfig::default(), network, catalog);
//!     let engine = Arc::new(engine);
//!     engine.start();
//!
//!     // Push attribute changes coming from the accessory layer.
//!     let merged = engine
//!         .set_device_state(&"0x00124b0001ce4b6e".into(), attributes, options)
//!         .await?;
//!
//!     // Unsolicited reports arrive on the update channel.
//!     while let Some(update) = updates.recv().await {
//!         println!("{}: {:?}", update.device, update.delta);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Message Flow
//!
//! ## Bridge → Device (set/get)
//!
//! 1. Accessory layer calls `set_device_state` / `get_device_state`
//! 2. ConverterPipeline orders attributes and resolves endpoints
//! 3. A converter encodes the wire command; reads register a pending key
//! 4. NetworkController transmits; responses settle the pending waiter
//! 5. Decoded state merges into the device cache
//!
//! ## Device → Bridge (reports)
//!
//! 1. NetworkController delivers a frame to `on_incoming_message`
//! 2. A frame matching a pending key settles that request
//! 3. Anything else is decoded by the matching converters
//! 4. The resulting delta merges into the cache and is pushed to the
//!    accessory layer on the update channel

#![warn(missing_docs)]

pub mod config;
pub mod configure;
pub mod engine;
pub mod error;
pub mod network;
pub mod pending;
pub mod pipeline;
pub mod test_utils;

pub use config::{CollisionPolicy, SyncConfig, SyncConfigBuilder};
pub use configure::{ConfigurationController, ConfigureStats};
pub use engine::{DeviceHandle, SyncEngine, SyncStats};
pub use error::{FlushReason, Result, SyncError};
pub use network::NetworkController;
pub use pending::{BatchOutcome, Deferred, PendingKey, PendingRequestTable, PendingStats};
pub use pipeline::{ConverterPipeline, PipelineStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
