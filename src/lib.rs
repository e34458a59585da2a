//! roomlink — mesh-topology call session layer.
//!
//! Establishes and maintains a multi-party peer-to-peer audio/video call
//! among the occupants of a shared room: every participant holds a direct
//! WebRTC link to every other participant, negotiated over a pluggable
//! signaling channel with at-least-once, unordered delivery.
//!
//! The moving parts, leaf to root:
//! - [`signal`] — the `video:*` protocol and the [`SignalingTransport`] seam.
//! - [`media`] — local capture ownership behind the [`MediaSource`] seam.
//! - [`registry`] — per-peer link lifecycle: creation, offer/answer/ICE
//!   exchange, teardown, rendering slots.
//! - [`roster`] — who is in the room, and who of them is in the call.
//! - [`session`] — the `idle → joining → joined → idle` controller that
//!   sequences it all and pumps signaling events.
//!
//! Rendering, the real socket, authentication and capture hardware live in
//! the embedder; this crate only coordinates the mesh.

mod config;
mod error;
mod identity;
mod media;
mod registry;
mod roster;
mod session;
mod signal;

pub use config::CallConfig;
pub use error::CallError;
pub use identity::{Identity, Participant, ParticipantWire, PeerId};
pub use media::{LocalMedia, MediaSource, SyntheticMediaSource};
pub use registry::{LinkRegistry, NegotiationRole, PeerLink, RemoteSlot, RemoteSlots};
pub use roster::Roster;
pub use session::{CallSession, SessionState};
pub use signal::{
    ChannelTransport, ClientSignal, ServerSignal, SignalingTransport, Subscription, UserMeta,
};
