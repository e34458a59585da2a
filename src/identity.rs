use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Opaque per-connection identity assigned by the signaling server.
///
/// Unique within a room, not persisted beyond the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The local connection identity.
///
/// The signaling server assigns an id per connection; before that happens
/// (or after a reconnect) there is no id.  Every use site has to handle
/// `Unresolved` explicitly — emission paths that need a `from` id skip the
/// emit and log instead of sending an empty sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(PeerId),
    Unresolved,
}

impl Identity {
    /// The id, if one has been assigned.
    pub fn known(&self) -> Option<&PeerId> {
        match self {
            Identity::Known(id) => Some(id),
            Identity::Unresolved => None,
        }
    }

    /// `true` when this identity is known and equals `other`.
    pub fn is(&self, other: &PeerId) -> bool {
        matches!(self, Identity::Known(id) if id == other)
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A room occupant as reported by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "socketId")]
    pub id: PeerId,
    #[serde(
        rename = "username",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<PeerId>, display_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            display_name,
        }
    }
}

/// Wire shape of a roster snapshot entry.
///
/// The server sends either a bare id string or a full participant object;
/// both normalize to [`Participant`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantWire {
    Full(Participant),
    Id(PeerId),
}

impl From<ParticipantWire> for Participant {
    fn from(wire: ParticipantWire) -> Self {
        match wire {
            ParticipantWire::Full(p) => p,
            ParticipantWire::Id(id) => Participant {
                id,
                display_name: None,
            },
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
