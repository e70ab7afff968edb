//! Shared domain model for the hivelink mesh-to-bridge synchronizer
//!
//! This crate defines the vocabulary both sides of the bridge speak:
//!
//! - [`device`] — device records, endpoints, interview status, persisted
//!   markers
//! - [`message`] — incoming wire frames and their classification
//! - [`state`] — cached attribute state with merge semantics
//! - [`profile`] — device profiles, the converter abstraction, and the
//!   command sink converters use to reach the network
//!
//! The synchronization engine itself lives in `hivelink-sync`; vendor
//! converter catalogs implement the traits defined here and are resolved
//! through [`profile::ProfileResolver`].

#![warn(missing_docs)]

pub mod device;
pub mod error;
pub mod message;
pub mod profile;
pub mod state;

pub use device::{DeviceId, DeviceRecord, InterviewState, CONFIGURED_META_KEY};
pub use error::{CoreError, Result};
pub use message::{IncomingMessage, MessageKind};
pub use profile::{
    endpoint_names, CommandSink, ConfigureRoutine, ConvertContext, Converter, DeviceProfile,
    ProfileResolver, SetOutcome, StaticProfileCatalog,
};
pub use state::{StateMap, StateUpdate};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
