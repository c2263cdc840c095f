//! # scene-sync — Real-time shared-scene replication over a star overlay
//!
//! Several participants share a live, mutable scene — object positions,
//! user presence, media calls — over direct peer connections. One
//! participant is the hub; everyone else is a spoke connected only to it.
//! The hub rebroadcasts every mutation so all spokes converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket    ┌──────────┐    WebSocket   ┌──────────┐
//! │ Spoke A  │ ◄────────────► │   Hub    │ ◄────────────► │ Spoke B  │
//! └────┬─────┘  Binary Proto  └────┬─────┘                └────┬─────┘
//!      │                           │                           │
//!      ▼                           ▼                           ▼
//! ┌──────────┐               ┌──────────┐               ┌──────────┐
//! │ Presence │               │ Presence │               │ Presence │
//! │ + Scene  │               │ + Scene  │               │ + Scene  │
//! └──────────┘               └──────────┘               └──────────┘
//!            (media calls run spoke↔spoke as a separate mesh)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (bincode-encoded events/batches)
//! - [`presence`] — Insertion-ordered registry of session participants
//! - [`batch`] — Per-tick coalescing of locally originated mutations
//! - [`scene`] — Replicated object poses and onboarding snapshots
//! - [`link`] — Per-connection state machine and outbound queue
//! - [`topology`] — Shared session plumbing, role trait, startup factory
//! - [`hub`] — Accepts all spokes, floods batches, evicts on disconnect
//! - [`spoke`] — Dials the hub, applies state, reconnects on loss
//! - [`media`] — Opaque call capability and stream association

pub mod batch;
pub mod hub;
pub mod link;
pub mod media;
pub mod presence;
pub mod protocol;
pub mod scene;
pub mod spoke;
pub mod topology;

// Re-exports for convenience
pub use batch::{EventBatcher, FLUSH_TICK};
pub use hub::{Hub, HubCore};
pub use link::{Link, LinkEvent, LinkState};
pub use media::{CallCapability, MediaError, MediaStream, StreamDirectory};
pub use presence::{PresenceRegistry, User};
pub use protocol::{Event, Frame, PeerSummary, ProtocolError};
pub use scene::{ObjectPose, SceneState};
pub use spoke::{Spoke, SpokeCore};
pub use topology::{
    ErrorLog, Session, SessionEvent, SyncConfig, SyncError, SyncHandle, TopologyRole,
};
