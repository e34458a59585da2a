//! Peer link registry — the core of the mesh.
//!
//! One [`PeerLink`] per remote participant while the call is active. The
//! registry owns creation, negotiation and teardown of every link, reacting
//! to signaling events that may arrive duplicated, late, or out of order.
//! Every async negotiation step carries the link's generation token and
//! re-checks it before emitting, so a negotiation resolving after teardown
//! (or after a rapid leave/re-join of the same id) is dropped instead of
//! resurrecting a removed link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::identity::{Identity, PeerId};
use crate::media::LocalMedia;
use crate::signal::{ClientSignal, SignalingTransport};

// ─── NegotiationRole ────────────────────────────────────────────────────────

/// Role this side plays in the link's current offer/answer exchange.
///
/// At most one exchange is outstanding per link: a second offer for the same
/// remote while one is pending is dropped, not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Idle,
    Offerer,
    Answerer,
}

// ─── PeerLink ───────────────────────────────────────────────────────────────

/// One direct media link to a remote participant.
pub struct PeerLink {
    pub remote: PeerId,
    pub pc: Arc<RTCPeerConnection>,
    /// Monotonic token assigned at creation; stale async steps compare it
    /// against the registry's current entry before acting.
    pub generation: u64,
    role: std::sync::RwLock<NegotiationRole>,
}

impl PeerLink {
    pub fn role(&self) -> NegotiationRole {
        *self.role.read().unwrap()
    }

    fn set_role(&self, role: NegotiationRole) {
        *self.role.write().unwrap() = role;
    }
}

// ─── RemoteSlots ────────────────────────────────────────────────────────────

/// Rendering slot for one remote participant.
///
/// Created on the first incoming track, reused for subsequent tracks of the
/// same remote, never duplicated.
pub struct RemoteSlot {
    pub remote: PeerId,
    tracks: std::sync::RwLock<Vec<Arc<TrackRemote>>>,
}

impl RemoteSlot {
    fn new(remote: PeerId) -> Self {
        Self {
            remote,
            tracks: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.read().unwrap().clone()
    }
}

/// Container of rendering slots, keyed by remote id.
///
/// Mutated only by the registry; the presentation layer reads it. Cheap to
/// clone (interior `Arc`).
#[derive(Clone, Default)]
pub struct RemoteSlots {
    inner: Arc<std::sync::RwLock<HashMap<PeerId, Arc<RemoteSlot>>>>,
}

impl RemoteSlots {
    /// Attach an incoming track, creating the slot on first use.
    pub fn attach(&self, remote: &PeerId, track: Arc<TrackRemote>) -> Arc<RemoteSlot> {
        let mut slots = self.inner.write().unwrap();
        let slot = slots
            .entry(remote.clone())
            .or_insert_with(|| Arc::new(RemoteSlot::new(remote.clone())))
            .clone();
        slot.tracks.write().unwrap().push(track);
        slot
    }

    pub fn get(&self, remote: &PeerId) -> Option<Arc<RemoteSlot>> {
        self.inner.read().unwrap().get(remote).cloned()
    }

    pub fn remove(&self, remote: &PeerId) {
        self.inner.write().unwrap().remove(remote);
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

// ─── PeerConnection factory ─────────────────────────────────────────────────

/// Create a new `RTCPeerConnection` with default codecs/interceptors and the
/// configured STUN servers.
async fn new_peer_connection(cfg: &CallConfig) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut interceptors = Registry::new();
    interceptors = register_default_interceptors(interceptors, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptors)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: cfg.stun_urls.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

// ─── LinkRegistry ───────────────────────────────────────────────────────────

struct RegistryInner {
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    links: std::sync::RwLock<HashMap<PeerId, Arc<PeerLink>>>,
    slots: RemoteSlots,
    local_media: std::sync::RwLock<Option<Arc<LocalMedia>>>,
    next_generation: AtomicU64,
    /// Cleared by [`LinkRegistry::clear`], restored by
    /// [`LinkRegistry::activate`]. A negotiation task that raced past the
    /// session's joined check cannot create links while this is down.
    active: AtomicBool,
}

impl RegistryInner {
    fn generation_of(&self, remote: &PeerId) -> Option<u64> {
        self.links.read().unwrap().get(remote).map(|l| l.generation)
    }
}

/// Owner of every peer link and its negotiation state.
///
/// Cheap to clone (interior `Arc`) so negotiation tasks can carry it
/// without tying its lifetime to theirs.
#[derive(Clone)]
pub struct LinkRegistry {
    inner: Arc<RegistryInner>,
}

impl LinkRegistry {
    pub fn new(config: CallConfig, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                transport,
                links: std::sync::RwLock::new(HashMap::new()),
                slots: RemoteSlots::default(),
                local_media: std::sync::RwLock::new(None),
                next_generation: AtomicU64::new(0),
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Reopen the registry after a [`Self::clear`], at the start of a join.
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::Relaxed);
    }

    /// Share (or withdraw) the local capture handle used for outbound tracks.
    pub fn set_local_media(&self, media: Option<Arc<LocalMedia>>) {
        *self.inner.local_media.write().unwrap() = media;
    }

    fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.inner.local_media.read().unwrap().clone()
    }

    pub fn get(&self, remote: &PeerId) -> Option<Arc<PeerLink>> {
        self.inner.links.read().unwrap().get(remote).cloned()
    }

    pub fn contains(&self, remote: &PeerId) -> bool {
        self.inner.links.read().unwrap().contains_key(remote)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.links.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.links.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.links.read().unwrap().is_empty()
    }

    /// Rendering slots for incoming tracks, keyed by remote id.
    pub fn slots(&self) -> &RemoteSlots {
        &self.inner.slots
    }

    /// `true` while `link` is the registry's current entry for its remote.
    pub fn is_live(&self, link: &PeerLink) -> bool {
        self.inner.generation_of(&link.remote) == Some(link.generation)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create a link for `remote`, or return the existing one.
    ///
    /// Duplicate creation requests are a no-op by contract — replacing the
    /// link would orphan an in-flight negotiation. Fails with
    /// [`CallError::TornDown`] after [`Self::clear`], so a negotiation task
    /// racing the teardown cannot resurrect the mesh.
    pub async fn create_link(&self, remote: &PeerId) -> Result<Arc<PeerLink>, CallError> {
        if !self.inner.active.load(Ordering::Relaxed) {
            return Err(CallError::TornDown);
        }
        if let Some(existing) = self.get(remote) {
            debug!("link for '{remote}' already exists");
            return Ok(existing);
        }

        let pc = new_peer_connection(&self.inner.config)
            .await
            .map_err(|source| CallError::PeerConnection {
                remote: remote.clone(),
                source,
            })?;

        // Attach every local track for outbound media.
        if let Some(media) = self.local_media() {
            for track in media.tracks() {
                if let Err(source) = pc.add_track(track).await {
                    let _ = pc.close().await;
                    return Err(CallError::TrackAttach {
                        remote: remote.clone(),
                        source,
                    });
                }
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Local candidate discovered → forward to the remote over signaling.
        {
            let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
            let remote = remote.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let registry = registry.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Some(registry) = registry.upgrade() else { return };
                    if registry.generation_of(&remote) != Some(generation) {
                        return; // link torn down
                    }
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!("serializing ICE candidate for '{remote}': {e}");
                            return;
                        }
                    };
                    let Identity::Known(from) = registry.transport.local_identity() else {
                        debug!("ICE candidate for '{remote}' dropped: local identity unresolved");
                        return;
                    };
                    if let Err(e) = registry.transport.emit(ClientSignal::Ice {
                        to: remote.clone(),
                        from,
                        candidate: init,
                    }) {
                        debug!("ICE candidate for '{remote}' not sent: {e}");
                    }
                })
            }));
        }

        // Remote track received → per-remote rendering slot.
        {
            let slots = self.inner.slots.clone();
            let remote = remote.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let slots = slots.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    info!("track received from '{remote}': kind={}", track.kind());
                    slots.attach(&remote, track);
                })
            }));
        }

        // Observed for future extension; nothing to act on yet.
        {
            let remote = remote.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let remote = remote.clone();
                Box::pin(async move {
                    debug!("link '{remote}' connection state: {state}");
                })
            }));
        }

        let link = Arc::new(PeerLink {
            remote: remote.clone(),
            pc: pc.clone(),
            generation,
            role: std::sync::RwLock::new(NegotiationRole::Idle),
        });

        // Insert-if-absent, re-checking the active flag under the same lock
        // clear() drains under. The guard must not live across an await, so
        // the verdict is computed first and the loser closed afterwards.
        let verdict = {
            let mut links = self.inner.links.write().unwrap();
            if !self.inner.active.load(Ordering::Relaxed) {
                Err(CallError::TornDown)
            } else if let Some(existing) = links.get(remote) {
                Ok(Some(existing.clone()))
            } else {
                links.insert(remote.clone(), link.clone());
                Ok(None)
            }
        };
        match verdict {
            Ok(None) => {
                info!("peer link created for '{remote}' (generation {generation})");
                Ok(link)
            }
            Ok(Some(existing)) => {
                let _ = pc.close().await;
                debug!("link for '{remote}' created concurrently, keeping the first");
                Ok(existing)
            }
            Err(e) => {
                let _ = pc.close().await;
                debug!("link for '{remote}' not created: call torn down");
                Err(e)
            }
        }
    }

    /// Close and discard the link for `remote`, plus its rendering slot.
    ///
    /// Tolerates unknown ids — local-leave and remote-leave teardown paths
    /// both call this and their ordering is not guaranteed.
    pub async fn remove_link(&self, remote: &PeerId) {
        let link = self.inner.links.write().unwrap().remove(remote);
        if let Some(link) = link {
            if let Err(e) = link.pc.close().await {
                warn!("closing link for '{remote}': {e}");
            }
            info!("peer link removed for '{remote}'");
        }
        self.inner.slots.remove(remote);
    }

    /// Tear down every link and rendering slot, and refuse new links until
    /// the next [`Self::activate`].
    pub async fn clear(&self) {
        self.inner.active.store(false, Ordering::Relaxed);
        let links: Vec<Arc<PeerLink>> = {
            let mut map = self.inner.links.write().unwrap();
            map.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            if let Err(e) = link.pc.close().await {
                warn!("closing link for '{}': {e}", link.remote);
            }
        }
        self.inner.slots.clear();
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    /// Start an offer exchange towards `remote`, creating the link if absent.
    ///
    /// Description failures are logged, not propagated — the link stays in
    /// place so the next membership event can retry.
    pub async fn initiate_offer(&self, remote: &PeerId) -> Result<(), CallError> {
        if self.inner.transport.local_identity().is(remote) {
            return Ok(());
        }
        let link = match self.create_link(remote).await {
            Ok(link) => link,
            Err(CallError::TornDown) => {
                debug!("offer to '{remote}' dropped: call torn down");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        {
            let mut role = link.role.write().unwrap();
            if *role != NegotiationRole::Idle {
                debug!("offer to '{remote}' dropped: negotiation already outstanding");
                return Ok(());
            }
            *role = NegotiationRole::Offerer;
        }

        let offer = match link.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("create_offer for '{remote}' failed: {e}");
                link.set_role(NegotiationRole::Idle);
                return Ok(());
            }
        };
        if let Err(e) = link.pc.set_local_description(offer).await {
            warn!("set_local_description (offer) for '{remote}' failed: {e}");
            link.set_role(NegotiationRole::Idle);
            return Ok(());
        }

        if !self.is_live(&link) {
            debug!("offer to '{remote}' abandoned: link torn down mid-negotiation");
            return Ok(());
        }
        let Some(local) = link.pc.local_description().await else {
            warn!("local description unavailable for '{remote}'");
            link.set_role(NegotiationRole::Idle);
            return Ok(());
        };
        let Some(from) = self.inner.transport.local_identity().known().cloned() else {
            warn!("offer to '{remote}' skipped: local identity unresolved");
            link.set_role(NegotiationRole::Idle);
            return Ok(());
        };

        if let Err(e) = self.inner.transport.emit(ClientSignal::Offer {
            to: remote.clone(),
            from,
            offer: local,
        }) {
            warn!("emitting offer to '{remote}': {e}");
            link.set_role(NegotiationRole::Idle);
            return Ok(());
        }
        debug!("offer sent to '{remote}'");
        Ok(())
    }

    /// Answer an incoming offer, creating the link if absent.
    pub async fn handle_offer(&self, from: &PeerId, offer: RTCSessionDescription) {
        let link = match self.create_link(from).await {
            Ok(link) => link,
            Err(CallError::TornDown) => {
                debug!("offer from '{from}' dropped: call torn down");
                return;
            }
            Err(e) => {
                warn!("cannot answer offer from '{from}': {e}");
                return;
            }
        };

        {
            let mut role = link.role.write().unwrap();
            match *role {
                NegotiationRole::Idle => *role = NegotiationRole::Answerer,
                NegotiationRole::Offerer => {
                    // The asymmetric trigger rule should prevent this.
                    warn!("offer from '{from}' while offering to them (glare)");
                }
                NegotiationRole::Answerer => {
                    debug!("duplicate offer from '{from}' dropped");
                    return;
                }
            }
        }

        if let Err(e) = link.pc.set_remote_description(offer).await {
            warn!("set_remote_description (offer) from '{from}' failed: {e}");
            link.set_role(NegotiationRole::Idle);
            return;
        }
        let answer = match link.pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("create_answer for '{from}' failed: {e}");
                link.set_role(NegotiationRole::Idle);
                return;
            }
        };
        if let Err(e) = link.pc.set_local_description(answer).await {
            warn!("set_local_description (answer) for '{from}' failed: {e}");
            link.set_role(NegotiationRole::Idle);
            return;
        }

        if !self.is_live(&link) {
            debug!("answer to '{from}' abandoned: link torn down mid-negotiation");
            return;
        }
        let Some(local) = link.pc.local_description().await else {
            warn!("local description unavailable for '{from}'");
            link.set_role(NegotiationRole::Idle);
            return;
        };
        let Some(self_id) = self.inner.transport.local_identity().known().cloned() else {
            warn!("answer to '{from}' skipped: local identity unresolved");
            link.set_role(NegotiationRole::Idle);
            return;
        };

        if let Err(e) = self.inner.transport.emit(ClientSignal::Answer {
            to: from.clone(),
            from: self_id,
            answer: local,
        }) {
            warn!("emitting answer to '{from}': {e}");
            link.set_role(NegotiationRole::Idle);
            return;
        }
        link.set_role(NegotiationRole::Idle);
        debug!("answer sent to '{from}'");
    }

    /// Apply a remote answer. Ignored when no link exists for `from` —
    /// late and duplicate answers are expected noise.
    pub async fn handle_answer(&self, from: &PeerId, answer: RTCSessionDescription) {
        let Some(link) = self.get(from) else {
            debug!("answer from '{from}' ignored: no link (late or duplicate)");
            return;
        };
        if let Err(e) = link.pc.set_remote_description(answer).await {
            warn!("applying answer from '{from}': {e}");
            return;
        }
        link.set_role(NegotiationRole::Idle);
        debug!("answer applied from '{from}'");
    }

    /// Add a relayed ICE candidate. Ignored when empty or when no link
    /// exists; failures are logged, not propagated — candidates can
    /// legitimately arrive after the link closed.
    pub async fn handle_ice(&self, from: &PeerId, candidate: Option<RTCIceCandidateInit>) {
        let Some(candidate) = candidate.filter(|c| !c.candidate.is_empty()) else {
            return;
        };
        let Some(link) = self.get(from) else {
            debug!("ICE candidate from '{from}' ignored: no link");
            return;
        };
        if let Err(e) = link.pc.add_ice_candidate(candidate).await {
            warn!("adding ICE candidate from '{from}': {e}");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
