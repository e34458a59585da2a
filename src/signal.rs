//! Signaling protocol types and the transport seam.
//!
//! The call core never talks to a socket directly: it emits [`ClientSignal`]s
//! and consumes [`ServerSignal`]s through the [`SignalingTransport`] trait.
//! The channel has at-least-once, unordered delivery semantics — duplicate
//! and stale signals are expected noise, handled by the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::CallError;
use crate::identity::{Identity, ParticipantWire, PeerId};

// ─── Wire types ─────────────────────────────────────────────────────────────

/// Local user metadata announced on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Client → server messages (offer/answer/ICE are relayed to `to`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientSignal {
    #[serde(rename = "video:join", rename_all = "camelCase")]
    Join { room_id: String, user: UserMeta },
    #[serde(rename = "video:leave", rename_all = "camelCase")]
    Leave { room_id: String },
    #[serde(rename = "video:offer")]
    Offer {
        to: PeerId,
        from: PeerId,
        offer: RTCSessionDescription,
    },
    #[serde(rename = "video:answer")]
    Answer {
        to: PeerId,
        from: PeerId,
        answer: RTCSessionDescription,
    },
    #[serde(rename = "video:ice")]
    Ice {
        to: PeerId,
        from: PeerId,
        candidate: RTCIceCandidateInit,
    },
}

impl ClientSignal {
    /// Wire event name, for logging.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Join { .. } => "video:join",
            Self::Leave { .. } => "video:leave",
            Self::Offer { .. } => "video:offer",
            Self::Answer { .. } => "video:answer",
            Self::Ice { .. } => "video:ice",
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerSignal {
    /// Full roster snapshot — replaces the roster wholesale.
    #[serde(rename = "video:users")]
    Users { participants: Vec<ParticipantWire> },
    #[serde(rename = "video:user-joined", rename_all = "camelCase")]
    UserJoined {
        socket_id: PeerId,
        #[serde(default)]
        username: Option<String>,
    },
    #[serde(rename = "video:user-left", rename_all = "camelCase")]
    UserLeft { socket_id: PeerId },
    #[serde(rename = "video:offer")]
    Offer {
        from: PeerId,
        offer: RTCSessionDescription,
    },
    #[serde(rename = "video:answer")]
    Answer {
        from: PeerId,
        answer: RTCSessionDescription,
    },
    #[serde(rename = "video:ice")]
    Ice {
        from: PeerId,
        /// Absent/empty candidates mark end-of-candidates and are ignored.
        #[serde(default)]
        candidate: Option<RTCIceCandidateInit>,
    },
    /// Display-only broadcast of who is currently in the call.
    #[serde(rename = "video:status")]
    Status { users: Vec<PeerId> },
}

// ─── Transport seam ─────────────────────────────────────────────────────────

/// Bidirectional signaling channel as seen by the call core.
///
/// Implementations wrap whatever carries the signals (a websocket, a
/// socket.io bridge, an in-memory hub in tests). `emit` must not block.
pub trait SignalingTransport: Send + Sync {
    /// Local identity as currently assigned by the signaling server.
    fn local_identity(&self) -> Identity;

    /// Whether the underlying channel is currently usable.
    fn is_connected(&self) -> bool;

    /// Send one signal towards the server.
    fn emit(&self, signal: ClientSignal) -> Result<(), CallError>;

    /// Subscribe to incoming signals.
    ///
    /// The returned [`Subscription`] is the disposer: dropping it detaches
    /// the subscriber, so handlers never observe signals after the owning
    /// session scope ends.
    fn subscribe(&self) -> Subscription;
}

/// Handle over an incoming signal stream; unsubscribes on drop.
pub struct Subscription {
    rx: broadcast::Receiver<ServerSignal>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ServerSignal>) -> Self {
        Self { rx }
    }

    /// Next signal in arrival order.
    ///
    /// Lagged gaps are logged and skipped (at-least-once channel — the
    /// registry tolerates missing intermediate signals). `None` once the
    /// transport side has shut down.
    pub async fn recv(&mut self) -> Option<ServerSignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("signal subscriber lagged, skipped {n} signal(s)");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ─── ChannelTransport ───────────────────────────────────────────────────────

/// In-memory [`SignalingTransport`] backed by tokio channels.
///
/// Incoming server signals are fanned out over a broadcast channel; outgoing
/// client signals are drained from the receiver returned by [`Self::new`].
/// Embedders that bridge a real socket pump that receiver and call
/// [`Self::deliver`]; tests wire several of these to an in-process hub.
pub struct ChannelTransport {
    identity: std::sync::RwLock<Identity>,
    connected: AtomicBool,
    inbound_tx: broadcast::Sender<ServerSignal>,
    outbound_tx: mpsc::UnboundedSender<ClientSignal>,
}

impl ChannelTransport {
    /// Create a transport plus the drain of everything it emits.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientSignal>) {
        let (inbound_tx, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            identity: std::sync::RwLock::new(Identity::Unresolved),
            connected: AtomicBool::new(true),
            inbound_tx,
            outbound_tx,
        });
        (transport, outbound_rx)
    }

    /// Record the identity assigned by the signaling server.
    pub fn set_identity(&self, id: PeerId) {
        *self.identity.write().unwrap() = Identity::Known(id);
    }

    /// Flip the connectivity flag (used to model a dropped channel).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Push a server signal to every live subscription.
    ///
    /// Succeeds silently when nobody is subscribed, same as an event bus
    /// with no consumers.
    pub fn deliver(&self, signal: ServerSignal) {
        let _ = self.inbound_tx.send(signal);
    }
}

impl SignalingTransport for ChannelTransport {
    fn local_identity(&self) -> Identity {
        self.identity.read().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn emit(&self, signal: ClientSignal) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::TransportUnavailable);
        }
        self.outbound_tx
            .send(signal)
            .map_err(|_| CallError::TransportUnavailable)
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.inbound_tx.subscribe())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
