//! Call session controller.
//!
//! Sequences media acquisition, roster subscription and registry activation
//! through the `idle → joining → joined → leaving → idle` state machine, and
//! pumps signaling events in arrival order. Negotiation steps are spawned
//! per-remote so slow SDP work never stalls the pump; the registry's
//! generation tokens keep stale completions harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::identity::{Participant, PeerId};
use crate::media::{LocalMedia, MediaSource};
use crate::registry::{LinkRegistry, RemoteSlots};
use crate::roster::Roster;
use crate::signal::{ClientSignal, ServerSignal, SignalingTransport, UserMeta};

// ─── SessionState ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Leaving,
}

// ─── CallSession ────────────────────────────────────────────────────────────

struct SessionInner {
    room_id: String,
    display_name: Option<String>,
    transport: Arc<dyn SignalingTransport>,
    media_source: Arc<dyn MediaSource>,
    registry: LinkRegistry,
    roster: std::sync::RwLock<Roster>,
    state: std::sync::RwLock<SessionState>,
    local_media: std::sync::RwLock<Option<Arc<LocalMedia>>>,
    muted: AtomicBool,
    camera_off: AtomicBool,
    cancel: CancellationToken,
}

/// Top-level handle for one client's participation in a room call.
///
/// The presentation layer reads the roster/slot snapshots and calls the
/// operations; everything else is driven by the signaling event pump.
/// Cheap to clone (interior `Arc`).
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        room_id: impl Into<String>,
        display_name: Option<String>,
        transport: Arc<dyn SignalingTransport>,
        media_source: Arc<dyn MediaSource>,
        config: CallConfig,
    ) -> Self {
        let registry = LinkRegistry::new(config, transport.clone());
        Self {
            inner: Arc::new(SessionInner {
                room_id: room_id.into(),
                display_name,
                transport,
                media_source,
                registry,
                roster: std::sync::RwLock::new(Roster::new()),
                state: std::sync::RwLock::new(SessionState::Idle),
                local_media: std::sync::RwLock::new(None),
                muted: AtomicBool::new(false),
                camera_off: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Presentation contract ───────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.inner.state.read().unwrap()
    }

    pub fn joined(&self) -> bool {
        self.state() == SessionState::Joined
    }

    pub fn muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    pub fn camera_off(&self) -> bool {
        self.inner.camera_off.load(Ordering::Relaxed)
    }

    /// The local preview handle, present while joined.
    pub fn local_preview(&self) -> Option<Arc<LocalMedia>> {
        self.inner.local_media.read().unwrap().clone()
    }

    /// Rendering slots for remote participants' tracks.
    pub fn remote_slots(&self) -> RemoteSlots {
        self.inner.registry.slots().clone()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.inner.roster.read().unwrap().participants().to_vec()
    }

    pub fn in_call_ids(&self) -> Vec<PeerId> {
        self.inner.roster.read().unwrap().in_call_ids()
    }

    /// Remote ids with an active peer link.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.registry.ids()
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Join the call: acquire local media, announce presence, go `Joined`.
    ///
    /// Fails fast without a transport and aborts back to `Idle` on capture
    /// failure — there is no partial join. A join while not idle is a no-op.
    pub async fn join(&self) -> Result<(), CallError> {
        if !self.inner.transport.is_connected() {
            warn!("join refused: signaling transport unavailable");
            return Err(CallError::TransportUnavailable);
        }
        {
            let mut state = self.inner.state.write().unwrap();
            if *state != SessionState::Idle {
                debug!("join ignored in state {:?}", *state);
                return Ok(());
            }
            *state = SessionState::Joining;
        }

        let media = match self.inner.media_source.acquire().await {
            Ok(media) => Arc::new(media),
            Err(e) => {
                warn!("local media capture failed: {e}");
                *self.inner.state.write().unwrap() = SessionState::Idle;
                return Err(e);
            }
        };

        // Apply toggles accumulated while idle (optimistic UI state).
        media.set_audio_enabled(!self.muted());
        media.set_video_enabled(!self.camera_off());

        *self.inner.local_media.write().unwrap() = Some(media.clone());
        self.inner.registry.activate();
        self.inner.registry.set_local_media(Some(media.clone()));

        let user = UserMeta {
            socket_id: self.inner.transport.local_identity().known().cloned(),
            username: self.inner.display_name.clone(),
        };
        if let Err(e) = self.inner.transport.emit(ClientSignal::Join {
            room_id: self.inner.room_id.clone(),
            user,
        }) {
            warn!("join announcement failed: {e}");
            media.stop();
            *self.inner.local_media.write().unwrap() = None;
            self.inner.registry.set_local_media(None);
            *self.inner.state.write().unwrap() = SessionState::Idle;
            return Err(e);
        }

        *self.inner.state.write().unwrap() = SessionState::Joined;
        info!("joined call in room '{}'", self.inner.room_id);
        Ok(())
    }

    /// Leave the call, releasing every resource. Idempotent.
    pub async fn leave(&self) {
        {
            let mut state = self.inner.state.write().unwrap();
            if matches!(*state, SessionState::Idle | SessionState::Leaving) {
                return;
            }
            *state = SessionState::Leaving;
        }

        if self.inner.transport.is_connected() {
            if let Err(e) = self.inner.transport.emit(ClientSignal::Leave {
                room_id: self.inner.room_id.clone(),
            }) {
                warn!("leave announcement failed: {e}");
            }
        }

        // Release the capture device even if the tracks are already stopped.
        if let Some(media) = self.inner.local_media.write().unwrap().take() {
            media.stop();
        }
        self.inner.registry.set_local_media(None);
        self.inner.registry.clear().await;
        self.inner.roster.write().unwrap().clear();

        *self.inner.state.write().unwrap() = SessionState::Idle;
        info!("left call in room '{}'", self.inner.room_id);
    }

    /// Flip the audio mute flag. Effective immediately when media exists,
    /// remembered for the next join otherwise.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.inner.muted.fetch_xor(true, Ordering::Relaxed);
        if let Some(media) = self.local_preview() {
            media.set_audio_enabled(!muted);
        }
        muted
    }

    /// Flip the camera flag, same semantics as [`Self::toggle_mute`].
    pub fn toggle_camera(&self) -> bool {
        let camera_off = !self.inner.camera_off.fetch_xor(true, Ordering::Relaxed);
        if let Some(media) = self.local_preview() {
            media.set_video_enabled(!camera_off);
        }
        camera_off
    }

    /// Cancel the event pump and leave unconditionally (teardown contract).
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.leave().await;
    }

    // ── Event pump ──────────────────────────────────────────────────────

    /// Spawn the signaling event pump.
    ///
    /// Events are processed strictly in arrival order; the subscription is
    /// dropped when the pump ends, detaching the handlers, and `leave()`
    /// runs unconditionally on the way out.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        // Subscribe before spawning so signals delivered ahead of the
        // task's first poll are queued, not lost.
        let mut subscription = self.inner.transport.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.inner.cancel.cancelled() => break,
                    signal = subscription.recv() => match signal {
                        Some(signal) => session.handle_signal(signal).await,
                        None => break,
                    },
                }
            }
            session.leave().await;
        })
    }

    async fn handle_signal(&self, signal: ServerSignal) {
        match signal {
            ServerSignal::Users { participants } => {
                let list: Vec<Participant> =
                    participants.into_iter().map(Into::into).collect();
                self.inner.roster.write().unwrap().replace(list.clone());
                if !self.joined() {
                    debug!("roster snapshot while not joined: no offers");
                    return;
                }
                for participant in list {
                    self.offer_if_unlinked(participant.id);
                }
            }
            ServerSignal::UserJoined {
                socket_id,
                username,
            } => {
                self.inner
                    .roster
                    .write()
                    .unwrap()
                    .add(Participant::new(socket_id.clone(), username));
                if !self.joined() {
                    return;
                }
                self.offer_if_unlinked(socket_id);
            }
            ServerSignal::UserLeft { socket_id } => {
                self.inner.roster.write().unwrap().remove(&socket_id);
                self.inner.registry.remove_link(&socket_id).await;
            }
            ServerSignal::Offer { from, offer } => {
                if !self.joined() {
                    debug!("offer from '{from}' ignored while not joined");
                    return;
                }
                let registry = self.inner.registry.clone();
                tokio::spawn(async move {
                    registry.handle_offer(&from, offer).await;
                });
            }
            ServerSignal::Answer { from, answer } => {
                self.inner.registry.handle_answer(&from, answer).await;
            }
            ServerSignal::Ice { from, candidate } => {
                self.inner.registry.handle_ice(&from, candidate).await;
            }
            ServerSignal::Status { users } => {
                self.inner.roster.write().unwrap().set_in_call(users);
            }
        }
    }

    /// Offer to `remote` unless it's us or a link already exists.
    ///
    /// Spawned so SDP work interleaves across remotes without stalling the
    /// pump; the registry re-checks link existence internally.
    fn offer_if_unlinked(&self, remote: PeerId) {
        if self.inner.transport.local_identity().is(&remote) {
            return;
        }
        if self.inner.registry.contains(&remote) {
            return;
        }
        let registry = self.inner.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.initiate_offer(&remote).await {
                warn!("offer to '{remote}' failed: {e}");
            }
        });
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ParticipantWire;
    use crate::media::SyntheticMediaSource;
    use crate::signal::ChannelTransport;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    // ── Fixtures ────────────────────────────────────────────────────────

    struct DeniedMediaSource;

    #[async_trait]
    impl MediaSource for DeniedMediaSource {
        async fn acquire(&self) -> Result<LocalMedia, CallError> {
            Err(CallError::MediaCapture("permission denied".into()))
        }
    }

    /// In-process stand-in for the signaling server.
    ///
    /// On a join it adds the participant, snapshots the roster to the
    /// members that were already in the call (the joiner answers, it never
    /// offers), and broadcasts the in-call status to everyone. Offers,
    /// answers and candidates are relayed to their addressee; offers are
    /// also logged for the glare assertions.
    #[derive(Default)]
    struct HubState {
        clients: HashMap<PeerId, Arc<ChannelTransport>>,
        in_call: Vec<Participant>,
        offers: Vec<(PeerId, PeerId)>,
    }

    #[derive(Clone, Default)]
    struct Hub {
        state: Arc<std::sync::Mutex<HubState>>,
    }

    impl Hub {
        fn connect(&self, id: &str) -> Arc<ChannelTransport> {
            let (transport, mut outbound) = ChannelTransport::new();
            let peer_id = PeerId::from(id);
            transport.set_identity(peer_id.clone());
            self.state
                .lock()
                .unwrap()
                .clients
                .insert(peer_id.clone(), transport.clone());

            let hub = self.clone();
            tokio::spawn(async move {
                while let Some(signal) = outbound.recv().await {
                    hub.route(&peer_id, signal);
                }
            });
            transport
        }

        fn route(&self, sender: &PeerId, signal: ClientSignal) {
            let mut state = self.state.lock().unwrap();
            match signal {
                ClientSignal::Join { user, .. } => {
                    let incumbents: Vec<PeerId> =
                        state.in_call.iter().map(|p| p.id.clone()).collect();
                    state
                        .in_call
                        .push(Participant::new(sender.clone(), user.username));
                    let snapshot: Vec<ParticipantWire> = state
                        .in_call
                        .iter()
                        .cloned()
                        .map(ParticipantWire::Full)
                        .collect();
                    for id in &incumbents {
                        if let Some(client) = state.clients.get(id) {
                            client.deliver(ServerSignal::Users {
                                participants: snapshot.clone(),
                            });
                        }
                    }
                    Self::broadcast_status(&state);
                }
                ClientSignal::Leave { .. } => {
                    state.in_call.retain(|p| &p.id != sender);
                    for p in &state.in_call {
                        if let Some(client) = state.clients.get(&p.id) {
                            client.deliver(ServerSignal::UserLeft {
                                socket_id: sender.clone(),
                            });
                        }
                    }
                    Self::broadcast_status(&state);
                }
                ClientSignal::Offer { to, from, offer } => {
                    state.offers.push((from.clone(), to.clone()));
                    if let Some(client) = state.clients.get(&to) {
                        client.deliver(ServerSignal::Offer { from, offer });
                    }
                }
                ClientSignal::Answer { to, from, answer } => {
                    if let Some(client) = state.clients.get(&to) {
                        client.deliver(ServerSignal::Answer { from, answer });
                    }
                }
                ClientSignal::Ice {
                    to,
                    from,
                    candidate,
                } => {
                    if let Some(client) = state.clients.get(&to) {
                        client.deliver(ServerSignal::Ice {
                            from,
                            candidate: Some(candidate),
                        });
                    }
                }
            }
        }

        fn broadcast_status(state: &HubState) {
            let users: Vec<PeerId> = state.in_call.iter().map(|p| p.id.clone()).collect();
            for client in state.clients.values() {
                client.deliver(ServerSignal::Status {
                    users: users.clone(),
                });
            }
        }

        fn offers(&self) -> Vec<(PeerId, PeerId)> {
            self.state.lock().unwrap().offers.clone()
        }
    }

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn session_on(hub: &Hub, id: &str) -> CallSession {
        init_tracing();
        let transport = hub.connect(id);
        CallSession::new(
            "room-1",
            Some(id.to_string()),
            transport,
            Arc::new(SyntheticMediaSource::default()),
            CallConfig::default(),
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    // ── Controller basics ───────────────────────────────────────────────

    #[tokio::test]
    async fn join_without_transport_fails_fast() {
        let (transport, _outbound) = ChannelTransport::new();
        transport.set_connected(false);
        let session = CallSession::new(
            "room-1",
            None,
            transport,
            Arc::new(SyntheticMediaSource::default()),
            CallConfig::default(),
        );
        assert!(matches!(
            session.join().await,
            Err(CallError::TransportUnavailable)
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn capture_denial_aborts_join_to_idle() {
        let (transport, mut outbound) = ChannelTransport::new();
        let session = CallSession::new(
            "room-1",
            None,
            transport,
            Arc::new(DeniedMediaSource),
            CallConfig::default(),
        );
        assert!(matches!(
            session.join().await,
            Err(CallError::MediaCapture(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.local_preview().is_none());
        // No partial join: nothing was announced.
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_announces_and_sets_preview() {
        let (transport, mut outbound) = ChannelTransport::new();
        transport.set_identity(PeerId::from("me"));
        let session = CallSession::new(
            "room-1",
            Some("ada".into()),
            transport,
            Arc::new(SyntheticMediaSource::default()),
            CallConfig::default(),
        );
        session.join().await.unwrap();
        assert!(session.joined());
        assert!(session.local_preview().is_some());

        let ClientSignal::Join { room_id, user } = outbound.try_recv().unwrap() else {
            panic!("expected join announcement");
        };
        assert_eq!(room_id, "room-1");
        assert_eq!(user.socket_id, Some(PeerId::from("me")));
        assert_eq!(user.username.as_deref(), Some("ada"));

        // Joining again is a no-op.
        session.join().await.unwrap();
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn toggles_are_optimistic_before_media_exists() {
        let (transport, _outbound) = ChannelTransport::new();
        let session = CallSession::new(
            "room-1",
            None,
            transport,
            Arc::new(SyntheticMediaSource::default()),
            CallConfig::default(),
        );
        assert!(session.toggle_mute());
        assert!(session.toggle_camera());
        assert!(session.muted());
        assert!(session.camera_off());

        // Flags carry over into the acquired media on join.
        session.join().await.unwrap();
        let media = session.local_preview().unwrap();
        assert!(!media.audio_enabled());
        assert!(!media.video_enabled());

        assert!(!session.toggle_mute());
        assert!(media.audio_enabled());
    }

    #[tokio::test]
    async fn no_links_before_join() {
        let hub = Hub::default();
        let session = session_on(&hub, "a");
        session.spawn();

        // Membership traffic while idle populates the roster only.
        let transport = hub.state.lock().unwrap().clients[&PeerId::from("a")].clone();
        transport.deliver(ServerSignal::UserJoined {
            socket_id: PeerId::from("b"),
            username: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(session.peer_ids().is_empty());
        assert_eq!(session.roster().len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn signals_delivered_right_after_spawn_are_not_lost() {
        init_tracing();
        let (transport, _outbound) = ChannelTransport::new();
        transport.set_identity(PeerId::from("a"));
        let session = CallSession::new(
            "room-1",
            None,
            transport.clone(),
            Arc::new(SyntheticMediaSource::default()),
            CallConfig::default(),
        );
        session.spawn();

        // Delivered before the pump task's first poll; the subscription
        // taken in spawn() must already be buffering.
        transport.deliver(ServerSignal::UserJoined {
            socket_id: PeerId::from("b"),
            username: None,
        });
        wait_until(|| session.roster().len() == 1).await;
        session.shutdown().await;
    }

    // ── Mesh scenarios ──────────────────────────────────────────────────

    #[tokio::test]
    async fn three_party_mesh_negotiates_each_pair_once() {
        let hub = Hub::default();
        let a = session_on(&hub, "a");
        let b = session_on(&hub, "b");
        let c = session_on(&hub, "c");
        a.spawn();
        b.spawn();
        c.spawn();

        a.join().await.unwrap();
        b.join().await.unwrap();
        wait_until(|| a.peer_ids().len() == 1 && b.peer_ids().len() == 1).await;

        c.join().await.unwrap();
        wait_until(|| {
            a.peer_ids().len() == 2 && b.peer_ids().len() == 2 && c.peer_ids().len() == 2
        })
        .await;

        // Exactly one offer per unordered pair, incumbent → joiner.
        let offers = hub.offers();
        assert_eq!(offers.len(), 3);
        let expect = |from: &str, to: &str| {
            assert!(
                offers.contains(&(PeerId::from(from), PeerId::from(to))),
                "missing offer {from} -> {to}: {offers:?}"
            );
            assert!(
                !offers.contains(&(PeerId::from(to), PeerId::from(from))),
                "glare: both {from} -> {to} and {to} -> {from}: {offers:?}"
            );
        };
        expect("a", "b");
        expect("a", "c");
        expect("b", "c");

        // The in-call subset stays a subset of each roster.
        for session in [&a, &b, &c] {
            let roster: Vec<PeerId> = session.roster().iter().map(|p| p.id.clone()).collect();
            for id in session.in_call_ids() {
                assert!(roster.contains(&id));
            }
        }

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test]
    async fn leave_releases_everything_and_is_idempotent() {
        let hub = Hub::default();
        let a = session_on(&hub, "a");
        let b = session_on(&hub, "b");
        a.spawn();
        b.spawn();

        a.join().await.unwrap();
        b.join().await.unwrap();
        wait_until(|| a.peer_ids().len() == 1 && b.peer_ids().len() == 1).await;

        let media = a.local_preview().unwrap();
        a.leave().await;

        assert_eq!(a.state(), SessionState::Idle);
        assert!(a.peer_ids().is_empty());
        assert!(a.remote_slots().is_empty());
        assert!(a.roster().is_empty());
        assert!(a.local_preview().is_none());
        assert!(media.is_stopped());

        // B is told and cleans its side of the pair.
        wait_until(|| b.peer_ids().is_empty()).await;

        // Second leave changes nothing.
        a.leave().await;
        assert_eq!(a.state(), SessionState::Idle);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn rejoin_after_leave_renegotiates() {
        let hub = Hub::default();
        let a = session_on(&hub, "a");
        let b = session_on(&hub, "b");
        a.spawn();
        b.spawn();

        a.join().await.unwrap();
        b.join().await.unwrap();
        wait_until(|| a.peer_ids().len() == 1 && b.peer_ids().len() == 1).await;

        b.leave().await;
        wait_until(|| a.peer_ids().is_empty()).await;

        b.join().await.unwrap();
        wait_until(|| a.peer_ids().len() == 1 && b.peer_ids().len() == 1).await;

        a.shutdown().await;
        b.shutdown().await;
    }
}
