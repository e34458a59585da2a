use thiserror::Error;

use crate::identity::PeerId;

/// Errors surfaced by the call session layer.
///
/// Nothing here is fatal to the host process: a capture or transport
/// failure aborts the join, a negotiation failure degrades one peer link
/// until the next membership event retries it.
#[derive(Debug, Error)]
pub enum CallError {
    /// The signaling channel is down — join/leave cannot announce anything.
    #[error("signaling transport is not connected")]
    TransportUnavailable,

    /// Local audio+video capture could not be acquired (permission denied,
    /// no device).
    #[error("local media capture failed: {0}")]
    MediaCapture(String),

    /// A negotiation task reached the registry after teardown.
    #[error("call torn down")]
    TornDown,

    /// The WebRTC peer connection object could not be constructed.
    #[error("failed to create peer connection for '{remote}': {source}")]
    PeerConnection {
        remote: PeerId,
        #[source]
        source: webrtc::Error,
    },

    /// A local track could not be attached to a peer connection.
    #[error("failed to attach local track for '{remote}': {source}")]
    TrackAttach {
        remote: PeerId,
        #[source]
        source: webrtc::Error,
    },
}
