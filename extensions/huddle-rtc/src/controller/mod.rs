use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use huddle::{
    call::{
        AccessGrant, CallConfig, CallEventKind, CallEventStream, CallSession, MediaKind,
        ParticipantId, ParticipantState, RoomId, Topology, TrackKind, TrackRef,
    },
    error::Error,
    sync::{Arc, Mutex, RwLock},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    correlation::RequestTracker,
    devices::MediaDevices,
    forwarding::{ForwardingContext, ForwardingSession, SfuDevice},
    media_state::MediaStateSync,
    mesh::{MeshContext, MeshNegotiator, PeerConnectionFactory},
    moderation::{Moderation, ModerationAction},
    probe::{self, MediaEngineAvailability},
    signaling::{ClientSignal, ServerSignal, SignalRouter, SignalingChannel},
};

mod capture;

pub use capture::LocalCaptureSet;

/// Collaborators supplied by the embedding application
pub struct CallDependencies {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    /// see [`crate::mesh::rtc::RtcPeerFactory::from_config`] for connections that honour
    /// [`CallConfig::ice_servers`]
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    /// `None` always selects the mesh
    pub sfu_device: Option<Arc<dyn SfuDevice>>,
}

#[derive(Clone)]
enum ActiveTopology {
    Mesh(MeshNegotiator),
    Forwarding(ForwardingSession),
}

impl ActiveTopology {
    fn kind(&self) -> Topology {
        match self {
            ActiveTopology::Mesh(_) => Topology::Mesh,
            ActiveTopology::Forwarding(_) => Topology::Forwarding,
        }
    }

    async fn close(&self) {
        match self {
            ActiveTopology::Mesh(mesh) => mesh.close().await,
            ActiveTopology::Forwarding(session) => session.close().await,
        }
    }
}

/// Owns the local capture devices and exactly one topology for the lifetime of a call.
///
/// Must be created inside a tokio runtime. Call [`CallSession::disconnect`] when done; it
/// releases every track, connection and background task.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    own_id: ParticipantId,
    room_id: RoomId,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    sfu_device: Option<Arc<dyn SfuDevice>>,
    tracker: Arc<RequestTracker>,
    router: SignalRouter,
    topology: RwLock<Option<ActiveTopology>>,
    // held across topology updates so toggles apply in order
    capture: tokio::sync::Mutex<LocalCaptureSet>,
    // the microphone slot of `capture`, reachable without waiting on a toggle
    microphone: Mutex<Option<TrackRef>>,
    media_state: MediaStateSync,
    moderation: Moderation,
    access: RwLock<Option<AccessGrant>>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
    token: CancellationToken,
    connecting: AtomicBool,
    disconnected: AtomicBool,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        own_id: ParticipantId,
        room_id: RoomId,
        config: CallConfig,
        deps: CallDependencies,
    ) -> Result<Self, Error> {
        config.validate()?;

        let (ui_event_ch, _) = broadcast::channel(config.event_channel_capacity);
        let tracker = Arc::new(RequestTracker::new(config.request_timeout()));
        let router = SignalRouter::spawn(
            deps.signaling.subscribe(),
            tracker.clone(),
            config.event_channel_capacity,
        );
        let media_state = MediaStateSync::new(
            own_id.clone(),
            room_id.clone(),
            deps.signaling.clone(),
            ui_event_ch.clone(),
        );
        let moderation = Moderation::new(own_id.clone(), room_id.clone(), deps.signaling.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                own_id,
                room_id,
                config,
                signaling: deps.signaling,
                devices: deps.devices,
                peer_factory: deps.peer_factory,
                sfu_device: deps.sfu_device,
                tracker,
                router,
                topology: RwLock::new(None),
                capture: tokio::sync::Mutex::new(LocalCaptureSet::default()),
                microphone: Mutex::new(None),
                media_state,
                moderation,
                access: RwLock::new(None),
                ui_event_ch,
                token: CancellationToken::new(),
                connecting: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                signal_task: Mutex::new(None),
            }),
        })
    }

    pub fn own_id(&self) -> &ParticipantId {
        &self.inner.own_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    /// the grant from the forwarding server. `None` in mesh mode
    pub fn access(&self) -> Option<AccessGrant> {
        *self.inner.access.read()
    }

    pub fn mesh(&self) -> Option<MeshNegotiator> {
        match self.inner.topology.read().as_ref() {
            Some(ActiveTopology::Mesh(mesh)) => Some(mesh.clone()),
            _ => None,
        }
    }

    pub fn forwarding(&self) -> Option<ForwardingSession> {
        match self.inner.topology.read().as_ref() {
            Some(ActiveTopology::Forwarding(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Probes for a forwarding server and joins the call through it, falling back to the
    /// mesh if it is unavailable or its startup fails. Only one connect per controller.
    pub async fn connect(&self) -> Result<Topology, Error> {
        self.ensure_active()?;
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            return Err(Error::CallAlreadyInProgress);
        }
        self.start_signal_handler();

        let availability = match (&self.inner.sfu_device, self.inner.config.allow_forwarding) {
            (Some(_), true) => {
                probe::probe(
                    &self.inner.tracker,
                    self.inner.signaling.as_ref(),
                    &self.inner.room_id,
                    self.inner.config.probe_timeout(),
                    &self.inner.token,
                )
                .await
            }
            _ => MediaEngineAvailability::unavailable(),
        };
        self.ensure_active()?;

        let topology = match availability.topology() {
            Topology::Forwarding => match self.start_forwarding().await {
                Ok(()) => Topology::Forwarding,
                Err(_) if !self.is_active() => return Err(Error::SessionClosed),
                Err(e) => {
                    log::warn!("forwarding startup failed, falling back to mesh: {e}");
                    self.start_mesh().await?;
                    Topology::Mesh
                }
            },
            Topology::Mesh => {
                self.start_mesh().await?;
                Topology::Mesh
            }
        };

        log::info!("joined call in {} using {topology}", self.inner.room_id);
        self.emit(CallEventKind::TopologySelected { topology });
        self.inner.media_state.announce();
        Ok(topology)
    }

    async fn start_forwarding(&self) -> Result<(), Error> {
        let Some(device) = self.inner.sfu_device.clone() else {
            return Err(Error::MediaEngineUnavailable);
        };
        let session = ForwardingSession::new(
            ForwardingContext {
                own_id: self.inner.own_id.clone(),
                room_id: self.inner.room_id.clone(),
                signaling: self.inner.signaling.clone(),
                tracker: self.inner.tracker.clone(),
                device,
                signals: self.inner.router.subscribe(),
                ui_event_ch: self.inner.ui_event_ch.clone(),
            },
            self.inner.token.child_token(),
        );
        let topology = ActiveTopology::Forwarding(session.clone());
        self.install(&topology).await?;

        let result = async {
            {
                let capture = self.inner.capture.lock().await;
                session.set_local_tracks(forwarding_tracks(&capture)).await?;
            }
            session.start().await
        }
        .await;

        match result {
            Ok(()) => {
                *self.inner.access.write() = session.access();
                Ok(())
            }
            Err(e) => {
                session.close().await;
                self.uninstall(Topology::Forwarding);
                Err(e)
            }
        }
    }

    async fn start_mesh(&self) -> Result<(), Error> {
        let mesh = MeshNegotiator::new(
            MeshContext {
                own_id: self.inner.own_id.clone(),
                room_id: self.inner.room_id.clone(),
                signaling: self.inner.signaling.clone(),
                factory: self.inner.peer_factory.clone(),
                ui_event_ch: self.inner.ui_event_ch.clone(),
            },
            self.inner.token.child_token(),
        );
        let topology = ActiveTopology::Mesh(mesh.clone());
        self.install(&topology).await?;

        let result = async {
            {
                let capture = self.inner.capture.lock().await;
                route_mesh(&mesh, &capture).await?;
            }
            self.inner
                .signaling
                .emit(ClientSignal::JoinCall {
                    room_id: self.inner.room_id.clone(),
                })
                .map_err(|e| Error::CallUnavailable(e.to_string()))
        }
        .await;

        if let Err(e) = result {
            mesh.close().await;
            self.uninstall(Topology::Mesh);
            if e.is_stale() || matches!(e, Error::CallUnavailable(_)) {
                return Err(e);
            }
            return Err(Error::CallUnavailable(e.to_string()));
        }
        Ok(())
    }

    async fn install(&self, topology: &ActiveTopology) -> Result<(), Error> {
        let installed = {
            let mut current = self.inner.topology.write();
            if self.is_active() {
                *current = Some(topology.clone());
                true
            } else {
                false
            }
        };
        if !installed {
            topology.close().await;
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn uninstall(&self, kind: Topology) {
        let mut current = self.inner.topology.write();
        if current.as_ref().map(|t| t.kind()) == Some(kind) {
            *current = None;
        }
    }

    /// pushes the capture set into whichever topology is active
    async fn route(&self, capture: &LocalCaptureSet) -> Result<(), Error> {
        let topology = self.inner.topology.read().clone();
        match topology {
            // applied when a topology is installed
            None => Ok(()),
            Some(ActiveTopology::Mesh(mesh)) => route_mesh(&mesh, capture).await,
            Some(ActiveTopology::Forwarding(session)) => {
                session.set_local_tracks(forwarding_tracks(capture)).await
            }
        }
    }

    async fn restore_route(&self, capture: &LocalCaptureSet) {
        if let Err(e) = self.route(capture).await {
            if !e.is_stale() {
                log::warn!("failed to restore media routing: {e}");
            }
        }
    }

    fn set_microphone(
        &self,
        capture: &mut LocalCaptureSet,
        track: Option<TrackRef>,
    ) -> Option<TrackRef> {
        *self.inner.microphone.lock() = track.clone();
        capture.set(MediaKind::Audio, track)
    }

    fn device_unavailable(&self, kind: MediaKind, e: Error) -> Result<bool, Error> {
        log::warn!("{kind} capture unavailable: {e}");
        self.emit(CallEventKind::DeviceUnavailable { kind });
        Ok(false)
    }

    /// turns the camera or screen capture on or off. an off capture is stopped, not paused
    async fn toggle_capture(&self, kind: MediaKind) -> Result<bool, Error> {
        self.ensure_active()?;
        let mut capture = self.inner.capture.lock().await;
        self.ensure_active()?;

        if let Some(track) = capture.set(kind, None) {
            if let Err(e) = self.route(&capture).await {
                capture.set(kind, Some(track));
                self.restore_route(&capture).await;
                return Err(e);
            }
            track.stop();
            let state = capture.state();
            drop(capture);
            self.inner.media_state.publish(state);
            return Ok(false);
        }

        let track = match self.inner.devices.acquire(kind).await {
            Ok(track) => track,
            Err(e) => return self.device_unavailable(kind, e),
        };
        if !self.is_active() {
            track.stop();
            return Err(Error::SessionClosed);
        }

        capture.set(kind, Some(track.clone()));
        if let Err(e) = self.route(&capture).await {
            capture.set(kind, None);
            track.stop();
            self.restore_route(&capture).await;
            return Err(e);
        }
        let state = capture.state();
        drop(capture);
        self.inner.media_state.publish(state);
        Ok(true)
    }

    fn start_signal_handler(&self) {
        let mut signals = self.inner.router.subscribe();
        let controller = self.clone();
        let token = self.inner.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = signals.recv() => match res {
                        Ok(signal) => controller.handle_signal(signal).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("call signal handler skipped {n} signals");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            log::trace!("call signal handler terminated");
        });
        *self.inner.signal_task.lock() = Some(handle);
    }

    async fn handle_signal(&self, signal: ServerSignal) {
        if !signal.is_for(&self.inner.room_id, &self.inner.own_id) {
            return;
        }

        if let Some(action) = self.inner.moderation.action_for(&signal) {
            match action {
                ModerationAction::ForceMute => self.apply_force_mute(),
                ModerationAction::Remove => self.apply_remove().await,
            }
            return;
        }

        let mesh = self.mesh();
        match signal {
            ServerSignal::MediaState {
                participant_id,
                state,
                ..
            } => self.inner.media_state.on_remote_update(&participant_id, state),
            ServerSignal::Joined { states, access, .. } => {
                self.inner.media_state.on_joined_snapshot(states);
                if let Some(access) = access {
                    self.update_access(access).await;
                }
            }
            ServerSignal::Roster { participants, .. } => {
                for participant_id in participants.iter().filter(|p| **p != self.inner.own_id) {
                    self.emit(CallEventKind::ParticipantJoined {
                        participant_id: participant_id.clone(),
                    });
                }
                if let Some(mesh) = mesh {
                    mesh.on_roster(&participants).await;
                }
            }
            ServerSignal::ParticipantJoined { participant_id, .. } => {
                if participant_id == self.inner.own_id {
                    return;
                }
                self.emit(CallEventKind::ParticipantJoined {
                    participant_id: participant_id.clone(),
                });
                if let Some(mesh) = mesh {
                    if let Err(e) = mesh.on_participant_joined(&participant_id).await {
                        log::error!("failed to connect to {participant_id}: {e}");
                    }
                }
            }
            ServerSignal::ParticipantLeft { participant_id, .. } => {
                self.inner.media_state.on_participant_left(&participant_id);
                if let Some(mesh) = mesh {
                    mesh.on_participant_left(&participant_id).await;
                }
                self.emit(CallEventKind::ParticipantLeft { participant_id });
            }
            ServerSignal::SessionDescription {
                source,
                description,
                ..
            } => match mesh {
                Some(mesh) => {
                    if let Err(e) = mesh.on_session_description(&source, description).await {
                        log::error!("failed to apply session description from {source}: {e}");
                    }
                }
                None => log::warn!("session description from {source} outside mesh mode"),
            },
            ServerSignal::IceCandidate {
                source, candidate, ..
            } => match mesh {
                Some(mesh) => {
                    if let Err(e) = mesh.on_ice_candidate(&source, candidate).await {
                        log::error!("failed to apply ice candidate from {source}: {e}");
                    }
                }
                None => log::warn!("ice candidate from {source} outside mesh mode"),
            },
            // handled by the forwarding session
            ServerSignal::NewProducer { .. }
            | ServerSignal::ProducerClosed { .. }
            | ServerSignal::Response { .. } => {}
            ServerSignal::ForceMuted { target, .. } => {
                log::debug!("{target} was force muted")
            }
            ServerSignal::Removed { target, .. } => log::debug!("{target} was removed"),
        }
    }

    async fn update_access(&self, access: AccessGrant) {
        *self.inner.access.write() = Some(access);
        if let Some(session) = self.forwarding() {
            if let Err(e) = session.set_access(access).await {
                log::warn!("failed to apply new access grant: {e}");
            }
        }
    }

    /// Disables the microphone without waiting for a toggle in progress. The topology catches
    /// up once the capture set is free.
    fn apply_force_mute(&self) {
        log::info!("microphone muted by host");
        let microphone = self.inner.microphone.lock().clone();
        if let Some(microphone) = microphone {
            microphone.set_enabled(false);
        }
        self.inner.media_state.set_muted(true);
        self.emit(CallEventKind::ForceMuted);

        let controller = self.clone();
        tokio::spawn(async move {
            let capture = controller.inner.capture.lock().await;
            if controller.is_active() {
                controller.restore_route(&capture).await;
            }
        });
    }

    async fn apply_remove(&self) {
        log::info!("removed from call by host");
        self.emit(CallEventKind::RemovedFromCall);
        if let Err(e) = self.disconnect().await {
            log::error!("failed to leave call after removal: {e}");
        }
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

fn forwarding_tracks(capture: &LocalCaptureSet) -> Vec<(MediaKind, Option<TrackRef>)> {
    MediaKind::ALL
        .iter()
        .map(|kind| (*kind, capture.outgoing(*kind)))
        .collect()
}

async fn route_mesh(mesh: &MeshNegotiator, capture: &LocalCaptureSet) -> Result<(), Error> {
    mesh.set_local_track(TrackKind::Audio, capture.outgoing(MediaKind::Audio))
        .await?;
    mesh.set_local_track(TrackKind::Video, capture.outgoing_video())
        .await
}

#[async_trait]
impl CallSession for SessionController {
    async fn get_event_stream(&self) -> Result<CallEventStream, Error> {
        let mut rx = self.inner.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(CallEventStream(Box::pin(stream)))
    }

    async fn toggle_microphone(&self) -> Result<bool, Error> {
        self.ensure_active()?;
        let mut capture = self.inner.capture.lock().await;
        self.ensure_active()?;

        let was_on = capture.microphone_on();
        let mut acquired = false;
        if !was_on && capture.get(MediaKind::Audio).is_none() {
            let track = match self.inner.devices.acquire(MediaKind::Audio).await {
                Ok(track) => track,
                Err(e) => return self.device_unavailable(MediaKind::Audio, e),
            };
            if !self.is_active() {
                track.stop();
                return Err(Error::SessionClosed);
            }
            self.set_microphone(&mut capture, Some(track));
            acquired = true;
        }
        if let Some(microphone) = capture.get(MediaKind::Audio) {
            microphone.set_enabled(!was_on);
        }

        if let Err(e) = self.route(&capture).await {
            if acquired {
                if let Some(track) = self.set_microphone(&mut capture, None) {
                    track.stop();
                }
            } else if let Some(microphone) = capture.get(MediaKind::Audio) {
                microphone.set_enabled(was_on);
            }
            self.restore_route(&capture).await;
            return Err(e);
        }

        let state = capture.state();
        drop(capture);
        self.inner.media_state.publish(state);
        Ok(!was_on)
    }

    async fn toggle_camera(&self) -> Result<bool, Error> {
        self.toggle_capture(MediaKind::Video).await
    }

    async fn toggle_screen_share(&self) -> Result<bool, Error> {
        self.toggle_capture(MediaKind::Screen).await
    }

    async fn force_mute(&self, target: &ParticipantId) -> Result<(), Error> {
        self.ensure_active()?;
        self.inner
            .moderation
            .force_mute(self.access().as_ref(), target)
    }

    async fn remove(&self, target: &ParticipantId) -> Result<(), Error> {
        self.ensure_active()?;
        self.inner.moderation.remove(self.access().as_ref(), target)
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("leaving call in {}", self.inner.room_id);
        self.inner.token.cancel();
        // the handler may be the caller; it exits on the token
        self.inner.signal_task.lock().take();

        let topology = self.inner.topology.write().take();
        if let Some(topology) = topology {
            topology.close().await;
        }
        self.inner.tracker.cancel_all();

        self.inner.microphone.lock().take();
        self.inner.capture.lock().await.stop_all();
        self.inner.media_state.reset();
        *self.inner.access.write() = None;

        if let Err(e) = self.inner.signaling.emit(ClientSignal::LeaveCall {
            room_id: self.inner.room_id.clone(),
        }) {
            log::error!("failed to send leave for {}: {e}", self.inner.room_id);
        }
        self.inner.router.stop();
        self.emit(CallEventKind::CallEnded);
        Ok(())
    }

    fn local_state(&self) -> ParticipantState {
        self.inner.media_state.local_state()
    }

    fn media_state(&self, participant: &ParticipantId) -> Option<ParticipantState> {
        self.inner.media_state.participant(participant)
    }

    fn topology(&self) -> Option<Topology> {
        self.inner.topology.read().as_ref().map(ActiveTopology::kind)
    }

    fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }
}
