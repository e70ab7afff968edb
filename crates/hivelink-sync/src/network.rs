//! Network controller seam
//!
//! The engine never touches the mesh radio directly; it talks to whatever
//! implements [`NetworkController`]. Converters receive the same object
//! narrowed to [`CommandSink`], so vendor catalogs cannot reach engine
//! internals.

use hivelink_core::CommandSink;

/// Mesh network controller as seen by the synchronization engine
///
/// Implemented by the adapter layer that owns the radio/coordinator. The
/// adapter also feeds events back into the engine by calling
/// `SyncEngine::on_incoming_message`, `on_device_joined`, and
/// `on_interview_complete`.
pub trait NetworkController: CommandSink {
    /// Endpoint on the coordinator used as the source of bindings during
    /// device commissioning
    fn coordinator_endpoint(&self) -> u8;

    /// Reserve the next outgoing transaction sequence number
    ///
    /// The engine registers the pending entry under this number before the
    /// converter transmits, so a fast response can never miss its waiter.
    fn next_sequence(&self) -> u8;
}
