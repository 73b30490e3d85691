//! Peer mesh: one direct connection to every other participant in the call.
//!
//! The participant whose id sorts first originates the offer for each pair. Local tracks are
//! attached to every connection when it is created and are swapped in place on the existing
//! sender afterwards, so toggling media never renegotiates a whole connection.
//!
//! ICE candidates that arrive before the connection exists, or before its remote description
//! is set, are buffered per participant and applied once the description lands.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use derive_more::Display;
use huddle::{
    call::{CallEventKind, ParticipantId, RemoteStream, RoomId, TrackKind, TrackRef},
    error::Error,
    sync::{Arc, Mutex},
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    signaling::{ClientSignal, IceCandidate, SdpKind, SessionDescription, SignalingChannel},
    streams::RemoteStreams,
};

mod peer;
pub mod rtc;

pub use peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SenderId,
};

/// Candidates held per participant until its offer arrives. Later ones are dropped.
pub const MAX_PENDING_CANDIDATES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PeerState {
    /// offer or answer outstanding, or ICE still checking
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "failed")]
    Failed,
}

struct Peer {
    connection: Arc<dyn PeerConnection>,
    state: PeerState,
    senders: HashMap<TrackKind, SenderId>,
    remote_description_set: bool,
    /// true if the local side sent the offer
    originator: bool,
}

#[derive(Default)]
struct MeshState {
    peers: HashMap<ParticipantId, Peer>,
    /// tracks attached to every current and future connection
    local_tracks: HashMap<TrackKind, TrackRef>,
    pending_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    streams: RemoteStreams,
}

pub struct MeshContext {
    pub own_id: ParticipantId,
    pub room_id: RoomId,
    pub signaling: Arc<dyn SignalingChannel>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub ui_event_ch: broadcast::Sender<CallEventKind>,
}

#[derive(Clone)]
pub struct MeshNegotiator {
    inner: Arc<Inner>,
}

struct Inner {
    own_id: ParticipantId,
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerConnectionFactory>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
    state: Mutex<MeshState>,
    // serializes connection setup and track changes
    ops: tokio::sync::Mutex<()>,
    event_tx: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl MeshNegotiator {
    pub fn new(ctx: MeshContext, token: CancellationToken) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            inner: Arc::new(Inner {
                own_id: ctx.own_id,
                room_id: ctx.room_id,
                signaling: ctx.signaling,
                factory: ctx.factory,
                ui_event_ch: ctx.ui_event_ch,
                state: Mutex::new(MeshState::default()),
                ops: tokio::sync::Mutex::new(()),
                event_tx,
                token,
                closed: AtomicBool::new(false),
            }),
        };

        tokio::spawn({
            let negotiator = negotiator.clone();
            async move { negotiator.run_peer_events(event_rx).await }
        });

        negotiator
    }

    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    pub fn peer_state(&self, peer_id: &ParticipantId) -> Option<PeerState> {
        self.inner.state.lock().peers.get(peer_id).map(|p| p.state)
    }

    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.inner.state.lock().peers.keys().cloned().collect()
    }

    pub fn stream(&self, peer_id: &ParticipantId) -> Option<RemoteStream> {
        self.inner.state.lock().streams.get(peer_id).cloned()
    }

    pub fn pending_candidates(&self, peer_id: &ParticipantId) -> usize {
        self.inner
            .state
            .lock()
            .pending_candidates
            .get(peer_id)
            .map_or(0, Vec::len)
    }

    /// every participant already in the call
    pub async fn on_roster(&self, participants: &[ParticipantId]) {
        for peer_id in participants {
            if let Err(e) = self.on_participant_joined(peer_id).await {
                log::error!("failed to connect to {peer_id}: {e}");
            }
        }
    }

    pub async fn on_participant_joined(&self, peer_id: &ParticipantId) -> Result<(), Error> {
        if peer_id == &self.inner.own_id {
            return Ok(());
        }
        let _guard = self.inner.ops.lock().await;
        self.ensure_active()?;

        if self.inner.state.lock().peers.contains_key(peer_id) {
            return Ok(());
        }

        if self.inner.own_id < *peer_id {
            self.originate(peer_id).await
        } else {
            log::trace!("waiting for offer from {peer_id}");
            Ok(())
        }
    }

    pub async fn on_session_description(
        &self,
        source: &ParticipantId,
        description: SessionDescription,
    ) -> Result<(), Error> {
        let _guard = self.inner.ops.lock().await;
        self.ensure_active()?;
        match description.kind {
            SdpKind::Offer => self.answer(source, description).await,
            SdpKind::Answer => self.accept_answer(source, description).await,
        }
    }

    /// applied immediately when possible, otherwise buffered until the remote description is set
    pub async fn on_ice_candidate(
        &self,
        source: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let connection = {
            let mut state = self.inner.state.lock();
            let ready = state
                .peers
                .get(source)
                .filter(|p| p.remote_description_set)
                .map(|p| p.connection.clone());
            match ready {
                Some(connection) => connection,
                None => {
                    let pending = state.pending_candidates.entry(source.clone()).or_default();
                    if pending.len() < MAX_PENDING_CANDIDATES {
                        pending.push(candidate);
                    } else {
                        log::warn!("dropping ice candidate from {source}: too many pending");
                    }
                    return Ok(());
                }
            }
        };
        connection.add_ice_candidate(candidate).await
    }

    pub async fn on_participant_left(&self, peer_id: &ParticipantId) {
        let _guard = self.inner.ops.lock().await;
        self.close_peer(peer_id).await;
    }

    /// Swaps the track on every open connection. `None` detaches the track from its sender.
    /// Failures on individual connections are logged and do not fail the change.
    pub async fn set_local_track(
        &self,
        kind: TrackKind,
        track: Option<TrackRef>,
    ) -> Result<(), Error> {
        let _guard = self.inner.ops.lock().await;
        self.ensure_active()?;

        let peers: Vec<_> = {
            let mut state = self.inner.state.lock();
            match &track {
                Some(track) => state.local_tracks.insert(kind, track.clone()),
                None => state.local_tracks.remove(&kind),
            };
            state
                .peers
                .iter()
                .map(|(id, p)| (id.clone(), p.connection.clone(), p.senders.get(&kind).cloned()))
                .collect()
        };

        for (peer_id, connection, sender) in peers {
            match (sender, &track) {
                (Some(sender), track) => {
                    if let Err(e) = connection.replace_track(&sender, track.clone()).await {
                        log::error!("failed to replace {kind} track for {peer_id}: {e}");
                    }
                }
                (None, Some(track)) => match connection.add_track(track.clone()).await {
                    Ok(sender) => {
                        if let Some(peer) = self.inner.state.lock().peers.get_mut(&peer_id) {
                            peer.senders.insert(kind, sender);
                        }
                    }
                    Err(e) => log::error!("failed to add {kind} track for {peer_id}: {e}"),
                },
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// Closes every connection and destroys every remote stream. Local tracks are left to
    /// their owner. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();

        let (peers, streams) = {
            let mut state = self.inner.state.lock();
            state.local_tracks.clear();
            state.pending_candidates.clear();
            let peers: Vec<_> = state.peers.drain().collect();
            (peers, state.streams.drain())
        };

        for (peer_id, peer) in peers {
            if let Err(e) = peer.connection.close().await {
                log::error!("failed to close connection to {peer_id}: {e}");
            }
        }

        for mut stream in streams {
            let participant_id = stream.participant_id().clone();
            stream.stop_all();
            self.emit(CallEventKind::StreamRemoved { participant_id });
        }
        log::trace!("mesh for {} closed", self.inner.room_id);
    }

    async fn originate(&self, peer_id: &ParticipantId) -> Result<(), Error> {
        let connection = self.open_connection(peer_id, true).await?;
        let result = async {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            self.ensure_active()?;
            self.send(ClientSignal::SessionDescription {
                room_id: self.inner.room_id.clone(),
                target: peer_id.clone(),
                description: offer,
            })
        }
        .await;

        if result.is_err() {
            self.close_peer(peer_id).await;
        }
        result
    }

    async fn answer(
        &self,
        source: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), Error> {
        let existing = {
            let state = self.inner.state.lock();
            state
                .peers
                .get(source)
                .map(|p| (p.connection.clone(), p.originator))
        };

        let created = existing.is_none();
        let connection = match existing {
            Some((_, true)) => {
                log::warn!("ignoring competing offer from {source}");
                return Ok(());
            }
            // the remote side restarted its offer on the same connection
            Some((connection, false)) => connection,
            None => self.open_connection(source, false).await?,
        };

        let result = async {
            connection.set_remote_description(offer).await?;
            self.flush_candidates(source, &connection).await;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            self.ensure_active()?;
            self.send(ClientSignal::SessionDescription {
                room_id: self.inner.room_id.clone(),
                target: source.clone(),
                description: answer,
            })
        }
        .await;

        if result.is_err() && created {
            self.close_peer(source).await;
        }
        result
    }

    async fn accept_answer(
        &self,
        source: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), Error> {
        let connection = self
            .inner
            .state
            .lock()
            .peers
            .get(source)
            .map(|p| p.connection.clone());

        let Some(connection) = connection else {
            log::warn!("answer from unknown peer {source}");
            return Err(Error::PeerNotFound(source.to_string()));
        };

        connection.set_remote_description(answer).await?;
        self.flush_candidates(source, &connection).await;
        Ok(())
    }

    /// creates the connection, attaches the held local tracks and registers the peer
    async fn open_connection(
        &self,
        peer_id: &ParticipantId,
        originator: bool,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let sink = PeerEventSink::new(peer_id.clone(), self.inner.event_tx.clone());
        let connection = self.inner.factory.create(peer_id, sink).await?;

        let tracks: Vec<_> = self
            .inner
            .state
            .lock()
            .local_tracks
            .iter()
            .map(|(kind, track)| (*kind, track.clone()))
            .collect();

        let mut senders = HashMap::new();
        for (kind, track) in tracks {
            match connection.add_track(track).await {
                Ok(sender) => {
                    senders.insert(kind, sender);
                }
                Err(e) => log::error!("failed to attach {kind} track for {peer_id}: {e}"),
            }
        }

        {
            let mut state = self.inner.state.lock();
            if self.is_active() {
                state.peers.insert(
                    peer_id.clone(),
                    Peer {
                        connection: connection.clone(),
                        state: PeerState::Connecting,
                        senders,
                        remote_description_set: false,
                        originator,
                    },
                );
                return Ok(connection);
            }
        }

        if let Err(e) = connection.close().await {
            log::error!("failed to close stale connection to {peer_id}: {e}");
        }
        Err(Error::SessionClosed)
    }

    async fn flush_candidates(&self, peer_id: &ParticipantId, connection: &Arc<dyn PeerConnection>) {
        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(peer) = state.peers.get_mut(peer_id) {
                peer.remote_description_set = true;
            }
            state.pending_candidates.remove(peer_id).unwrap_or_default()
        };
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                log::error!("failed to apply buffered candidate from {peer_id}: {e}");
            }
        }
    }

    async fn close_peer(&self, peer_id: &ParticipantId) {
        let (peer, stream) = {
            let mut state = self.inner.state.lock();
            state.pending_candidates.remove(peer_id);
            (state.peers.remove(peer_id), state.streams.remove_owner(peer_id))
        };

        match peer {
            Some(peer) => {
                if let Err(e) = peer.connection.close().await {
                    log::error!("failed to close connection to {peer_id}: {e}");
                }
            }
            None => log::debug!("no connection to close for {peer_id}"),
        }

        if let Some(mut stream) = stream {
            stream.stop_all();
            self.emit(CallEventKind::StreamRemoved {
                participant_id: peer_id.clone(),
            });
        }
    }

    async fn run_peer_events(
        &self,
        mut event_rx: mpsc::UnboundedReceiver<(ParticipantId, PeerEvent)>,
    ) {
        let token = self.inner.token.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                opt = event_rx.recv() => match opt {
                    Some((peer_id, event)) => self.handle_peer_event(peer_id, event),
                    None => break,
                }
            }
        }
        log::trace!("mesh peer event loop terminated");
    }

    fn handle_peer_event(&self, peer_id: ParticipantId, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self.send(ClientSignal::IceCandidate {
                    room_id: self.inner.room_id.clone(),
                    target: peer_id.clone(),
                    candidate,
                }) {
                    log::error!("failed to send ice candidate to {peer_id}: {e}");
                }
            }
            PeerEvent::Track(track) => {
                let snapshot = {
                    let mut state = self.inner.state.lock();
                    if !state.peers.contains_key(&peer_id) {
                        None
                    } else {
                        Some(state.streams.add_track(&peer_id, track.clone()))
                    }
                };
                match snapshot {
                    Some(Some(stream)) => self.emit(CallEventKind::StreamUpdated { stream }),
                    Some(None) => {}
                    None => {
                        log::warn!("track from closed connection {peer_id}");
                        track.stop();
                    }
                }
            }
            PeerEvent::TrackEnded { track_id } => {
                let change = self
                    .inner
                    .state
                    .lock()
                    .streams
                    .remove_track(&peer_id, &track_id);
                if let Some(event) = change.into_event() {
                    self.emit(event);
                }
            }
            PeerEvent::StateChanged(connection_state) => {
                log::info!("connection state for {peer_id} changed to {connection_state}");
                let new_state = match connection_state {
                    ConnectionState::Connected => PeerState::Connected,
                    ConnectionState::Failed => PeerState::Failed,
                    _ => return,
                };
                let changed = {
                    let mut state = self.inner.state.lock();
                    match state.peers.get_mut(&peer_id) {
                        Some(peer) if peer.state != new_state => {
                            peer.state = new_state;
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    let participant_id = peer_id;
                    self.emit(match new_state {
                        PeerState::Connected => CallEventKind::ParticipantConnected { participant_id },
                        _ => CallEventKind::ConnectionFailed { participant_id },
                    });
                }
            }
        }
    }

    fn send(&self, signal: ClientSignal) -> Result<(), Error> {
        self.inner.signaling.emit(signal)
    }

    fn emit(&self, event: CallEventKind) {
        if self.inner.ui_event_ch.send(event).is_err() {
            log::trace!("no listeners for call events");
        }
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }
}
