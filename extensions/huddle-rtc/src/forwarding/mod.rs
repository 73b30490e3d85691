//! Forwarding session client: one uplink and one downlink transport to a selective
//! forwarding server.
//!
//! Startup runs in a fixed order (capabilities, join, device load, transports, initial
//! consumes, pushed-event listener, local productions). Every step re-checks the session token
//! after its await, and anything obtained by a step that finishes after [`ForwardingSession::close`]
//! is released instead of stored.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::future::join_all;
use huddle::{
    call::{AccessGrant, CallEventKind, MediaKind, ParticipantId, RemoteStream, RoomId, TrackRef},
    error::Error,
    sync::{Arc, Mutex},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    correlation::RequestTracker,
    signaling::{
        ClientSignal, DtlsParameters, ProducerId, RemoteProducer, ResponseKind, RtpCapabilities,
        RtpParameters, ServerSignal, SfuRequest, SfuResponse, SignalingChannel,
        TransportDirection, TransportId,
    },
};

mod consumers;
mod device;
mod producers;

pub use consumers::{Completion, ConsumerTable, PeerLeft, ProducerClosed};
pub use device::{Consumer, Producer, SfuDevice, SfuTransport, TransportHandler};
pub use producers::ProducerSlots;

pub struct ForwardingContext {
    pub own_id: ParticipantId,
    pub room_id: RoomId,
    pub signaling: Arc<dyn SignalingChannel>,
    pub tracker: Arc<RequestTracker>,
    pub device: Arc<dyn SfuDevice>,
    /// subscribe before calling `start` so pushed events between join and listener
    /// startup are kept
    pub signals: broadcast::Receiver<ServerSignal>,
    pub ui_event_ch: broadcast::Sender<CallEventKind>,
}

/// correlated requests made on behalf of the session and its transports
#[derive(Clone)]
struct ControlChannel {
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
    tracker: Arc<RequestTracker>,
    token: CancellationToken,
}

impl ControlChannel {
    async fn request(&self, request: SfuRequest) -> Result<SfuResponse, Error> {
        self.tracker
            .request(self.signaling.as_ref(), &self.room_id, request, &self.token)
            .await
    }
}

#[async_trait]
impl TransportHandler for ControlChannel {
    async fn on_connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        self.request(SfuRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters,
        })
        .await?;
        Ok(())
    }

    async fn on_produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, Error> {
        match self
            .request(SfuRequest::Produce {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
            })
            .await?
        {
            SfuResponse::Produced { producer_id } => Ok(producer_id),
            other => Err(unexpected(ResponseKind::Produced, &other)),
        }
    }
}

#[derive(Default)]
struct SessionState {
    access: Option<AccessGrant>,
    participants: Vec<ParticipantId>,
    rtp_capabilities: Option<RtpCapabilities>,
    send_transport: Option<Arc<dyn SfuTransport>>,
    recv_transport: Option<Arc<dyn SfuTransport>>,
    consumers: ConsumerTable,
    /// local productions may be pushed
    started: bool,
}

#[derive(Clone)]
pub struct ForwardingSession {
    inner: Arc<Inner>,
}

struct Inner {
    own_id: ParticipantId,
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
    device: Arc<dyn SfuDevice>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
    control: ControlChannel,
    token: CancellationToken,
    closed: AtomicBool,
    state: Mutex<SessionState>,
    // held across the produce/close round trips
    producers: tokio::sync::Mutex<ProducerSlots>,
    /// last track requested per kind, pushed at startup and re-pushed on access changes
    local_tracks: Mutex<HashMap<MediaKind, TrackRef>>,
    signals: Mutex<Option<broadcast::Receiver<ServerSignal>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardingSession {
    /// does no I/O. call [`ForwardingSession::start`] to join
    pub fn new(ctx: ForwardingContext, token: CancellationToken) -> Self {
        let control = ControlChannel {
            room_id: ctx.room_id.clone(),
            signaling: ctx.signaling.clone(),
            tracker: ctx.tracker,
            token: token.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                own_id: ctx.own_id,
                room_id: ctx.room_id,
                signaling: ctx.signaling,
                device: ctx.device,
                ui_event_ch: ctx.ui_event_ch,
                control,
                token,
                closed: AtomicBool::new(false),
                state: Mutex::new(SessionState::default()),
                producers: tokio::sync::Mutex::new(ProducerSlots::default()),
                local_tracks: Mutex::new(HashMap::new()),
                signals: Mutex::new(Some(ctx.signals)),
                listener: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<(), Error> {
        let router_capabilities = match self.request(SfuRequest::GetCapabilities).await? {
            SfuResponse::Capabilities {
                running: true,
                rtp_capabilities,
            } => rtp_capabilities,
            SfuResponse::Capabilities { running: false, .. } => {
                return Err(Error::MediaEngineUnavailable)
            }
            other => return Err(unexpected(ResponseKind::Capabilities, &other)),
        };
        self.ensure_active()?;

        let (participants, producers, access) = match self.request(SfuRequest::Join).await? {
            SfuResponse::Joined {
                participants,
                producers,
                access,
            } => (participants, producers, access),
            other => return Err(unexpected(ResponseKind::Joined, &other)),
        };
        self.ensure_active()?;
        log::debug!(
            "joined {} as {}: {} participants, {} productions",
            self.inner.room_id,
            access.role,
            participants.len(),
            producers.len()
        );
        {
            let mut state = self.inner.state.lock();
            state.access = Some(access);
            state.participants = participants;
        }

        self.inner.device.load(&router_capabilities).await?;
        self.ensure_active()?;
        let rtp_capabilities = self.inner.device.rtp_capabilities()?;
        self.inner.state.lock().rtp_capabilities = Some(rtp_capabilities);

        self.create_transport(TransportDirection::Send).await?;
        self.create_transport(TransportDirection::Recv).await?;

        self.consume_initial(producers).await?;

        self.start_listener()?;

        self.inner.state.lock().started = true;
        self.apply_local_tracks().await?;
        log::trace!("forwarding session for {} started", self.inner.room_id);
        Ok(())
    }

    /// Requests `track` as the production for `kind`. Before startup completes the request is
    /// only remembered. A grant that forbids producing closes all productions instead.
    pub async fn set_local_track(
        &self,
        kind: MediaKind,
        track: Option<TrackRef>,
    ) -> Result<(), Error> {
        self.set_local_tracks(vec![(kind, track)]).await
    }

    /// several kinds at once, applied in a single pass
    pub async fn set_local_tracks(
        &self,
        tracks: Vec<(MediaKind, Option<TrackRef>)>,
    ) -> Result<(), Error> {
        {
            let mut local_tracks = self.inner.local_tracks.lock();
            for (kind, track) in tracks {
                match track {
                    Some(track) => local_tracks.insert(kind, track),
                    None => local_tracks.remove(&kind),
                };
            }
        }
        if !self.inner.state.lock().started {
            return Ok(());
        }
        self.ensure_active()?;
        self.apply_local_tracks().await
    }

    /// a new grant from the server. productions are re-evaluated against it
    pub async fn set_access(&self, access: AccessGrant) -> Result<(), Error> {
        let started = {
            let mut state = self.inner.state.lock();
            state.access = Some(access);
            state.started
        };
        if started {
            self.apply_local_tracks().await?;
        }
        Ok(())
    }

    pub async fn consume_producer(
        &self,
        producer_id: ProducerId,
        owner_id: ParticipantId,
    ) -> Result<(), Error> {
        if let Some(stream) = self.consume(&producer_id, &owner_id).await? {
            self.emit(CallEventKind::StreamUpdated { stream });
        }
        Ok(())
    }

    pub async fn on_producer_closed(&self, producer_id: &ProducerId) {
        {
            let mut slots = self.inner.producers.lock().await;
            if let Some(kind) = slots.find(producer_id) {
                log::info!("server closed local {kind} production");
                if let Some(producer) = slots.take(kind) {
                    producer.close();
                }
                return;
            }
        }

        let outcome = self.inner.state.lock().consumers.on_producer_closed(producer_id);
        match outcome {
            ProducerClosed::Removed { consumer, change } => {
                release(consumer);
                if let Some(event) = change.into_event() {
                    self.emit(event);
                }
            }
            ProducerClosed::Pending => {
                log::debug!("producer {producer_id} closed while being consumed")
            }
            ProducerClosed::Unknown => log::debug!("close for unknown producer {producer_id}"),
        }
    }

    pub fn on_peer_left(&self, owner: &ParticipantId) {
        let left = {
            let mut state = self.inner.state.lock();
            state.participants.retain(|p| p != owner);
            state.consumers.on_peer_left(owner)
        };
        for consumer in left.consumers {
            release(consumer);
        }
        if let Some(mut stream) = left.stream {
            stream.stop_all();
            self.emit(CallEventKind::StreamRemoved {
                participant_id: owner.clone(),
            });
        }
    }

    /// Stops the listener, cancels pending requests, releases every consumer, production and
    /// transport, then tells the server we left. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        self.inner.signals.lock().take();

        let (consumers, streams, send, recv) = {
            let mut state = self.inner.state.lock();
            let (consumers, streams) = state.consumers.clear();
            state.started = false;
            (
                consumers,
                streams,
                state.send_transport.take(),
                state.recv_transport.take(),
            )
        };

        for consumer in consumers {
            release(consumer);
        }
        for mut stream in streams {
            let participant_id = stream.participant_id().clone();
            stream.stop_all();
            self.emit(CallEventKind::StreamRemoved { participant_id });
        }

        let producers = self.inner.producers.lock().await.drain();
        for producer in producers {
            producer.close();
        }
        for transport in [send, recv].into_iter().flatten() {
            transport.close();
        }

        if let Err(e) = self.inner.signaling.emit(ClientSignal::ForwardingLeave {
            room_id: self.inner.room_id.clone(),
        }) {
            log::error!("failed to send leave for {}: {e}", self.inner.room_id);
        }
        log::trace!("forwarding session for {} closed", self.inner.room_id);
    }

    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    pub fn access(&self) -> Option<AccessGrant> {
        self.inner.state.lock().access
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.inner.state.lock().participants.clone()
    }

    pub fn has_transports(&self) -> bool {
        let state = self.inner.state.lock();
        state.send_transport.is_some() && state.recv_transport.is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    pub fn stream(&self, owner: &ParticipantId) -> Option<RemoteStream> {
        self.inner.state.lock().consumers.stream(owner).cloned()
    }

    pub async fn producer_id(&self, kind: MediaKind) -> Option<ProducerId> {
        self.inner
            .producers
            .lock()
            .await
            .get(kind)
            .map(|p| p.id().to_string())
    }

    pub async fn production_count(&self) -> usize {
        self.inner.producers.lock().await.len()
    }

    pub async fn video_production_count(&self) -> usize {
        self.inner.producers.lock().await.video_count()
    }

    async fn request(&self, request: SfuRequest) -> Result<SfuResponse, Error> {
        self.inner.control.request(request).await
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<(), Error> {
        let parameters = match self
            .request(SfuRequest::CreateTransport { direction })
            .await?
        {
            SfuResponse::TransportCreated { transport } => transport,
            other => return Err(unexpected(ResponseKind::TransportCreated, &other)),
        };
        self.ensure_active()?;

        let handler: Arc<dyn TransportHandler> = Arc::new(self.inner.control.clone());
        let transport = self
            .inner
            .device
            .create_transport(direction, parameters, handler)
            .await?;

        {
            let mut state = self.inner.state.lock();
            if self.is_active() {
                match direction {
                    TransportDirection::Send => state.send_transport = Some(transport),
                    TransportDirection::Recv => state.recv_transport = Some(transport),
                }
                return Ok(());
            }
        }

        transport.close();
        Err(Error::SessionClosed)
    }

    /// consumes the productions that were active at join time. each owner's aggregate is
    /// announced once, after the whole batch
    async fn consume_initial(&self, producers: Vec<RemoteProducer>) -> Result<(), Error> {
        let results = join_all(
            producers
                .iter()
                .map(|p| self.consume(&p.producer_id, &p.owner_id)),
        )
        .await;

        let mut owners: Vec<ParticipantId> = vec![];
        for (producer, result) in producers.iter().zip(results) {
            match result {
                Ok(Some(_)) => {
                    if !owners.contains(&producer.owner_id) {
                        owners.push(producer.owner_id.clone());
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_stale() => return Err(Error::SessionClosed),
                Err(e) => log::error!("failed to consume {}: {e}", producer.producer_id),
            }
        }

        for owner in owners {
            let stream = self.inner.state.lock().consumers.stream(&owner).cloned();
            if let Some(stream) = stream {
                self.emit(CallEventKind::StreamUpdated { stream });
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        owner_id: &ParticipantId,
    ) -> Result<Option<RemoteStream>, Error> {
        self.ensure_active()?;
        if owner_id == &self.inner.own_id {
            return Ok(None);
        }

        let (transport, rtp_capabilities) = {
            let mut state = self.inner.state.lock();
            let (Some(transport), Some(rtp_capabilities)) =
                (state.recv_transport.clone(), state.rtp_capabilities.clone())
            else {
                return Err(Error::CallNotInitialized);
            };
            if !state.consumers.begin(producer_id, owner_id) {
                log::debug!("producer {producer_id} already consumed");
                return Ok(None);
            }
            (transport, rtp_capabilities)
        };

        let result = async {
            let parameters = match self
                .request(SfuRequest::Consume {
                    producer_id: producer_id.clone(),
                    rtp_capabilities,
                })
                .await?
            {
                SfuResponse::Consumed { consumer } => consumer,
                other => return Err(unexpected(ResponseKind::Consumed, &other)),
            };
            self.ensure_active()?;
            transport.consume(parameters).await
        }
        .await;

        let consumer = match result {
            Ok(consumer) => consumer,
            Err(e) => {
                self.inner.state.lock().consumers.abort(producer_id);
                return Err(e);
            }
        };

        let completion = {
            let mut state = self.inner.state.lock();
            if !self.is_active() {
                None
            } else {
                Some(state.consumers.complete(producer_id, consumer.clone()))
            }
        };

        match completion {
            Some(Completion::Added { owner, stream }) => {
                log::debug!("consuming {} from {owner}", consumer.kind());
                Ok(stream)
            }
            Some(Completion::Cancelled(consumer)) => {
                log::debug!("consume of {producer_id} cancelled");
                release(consumer);
                Ok(None)
            }
            None => {
                release(consumer);
                Err(Error::SessionClosed)
            }
        }
    }

    /// brings productions in line with the requested tracks and the access grant
    async fn apply_local_tracks(&self) -> Result<(), Error> {
        let access = self.access();
        let requested = self.inner.local_tracks.lock().clone();
        let desired: Vec<(MediaKind, Option<TrackRef>)> = MediaKind::ALL
            .iter()
            .map(|kind| {
                let permitted = access.map_or(true, |a| a.permits(*kind));
                let track = requested.get(kind).cloned().filter(|_| permitted);
                (*kind, track)
            })
            .collect();

        let mut slots = self.inner.producers.lock().await;
        // closes before opens, so camera and screen never overlap
        for (kind, _) in desired.iter().filter(|(_, t)| t.is_none()) {
            self.apply(&mut slots, *kind, None).await?;
        }
        for (kind, track) in desired.into_iter().filter(|(_, t)| t.is_some()) {
            self.apply(&mut slots, kind, track).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        slots: &mut ProducerSlots,
        kind: MediaKind,
        track: Option<TrackRef>,
    ) -> Result<(), Error> {
        let current = slots.get(kind).map(|p| p.track().id().to_string());
        match (current, track) {
            (Some(current), Some(track)) if current == track.id() => Ok(()),
            (Some(_), Some(track)) => {
                self.close_production(slots, kind).await?;
                self.produce(slots, kind, track).await
            }
            (None, Some(track)) => self.produce(slots, kind, track).await,
            (Some(_), None) => self.close_production(slots, kind).await,
            (None, None) => Ok(()),
        }
    }

    async fn produce(
        &self,
        slots: &mut ProducerSlots,
        kind: MediaKind,
        track: TrackRef,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let transport = self
            .inner
            .state
            .lock()
            .send_transport
            .clone()
            .ok_or(Error::CallNotInitialized)?;

        let producer = transport.produce(track, kind).await?;
        if !self.is_active() {
            producer.close();
            return Err(Error::SessionClosed);
        }
        log::debug!("producing {kind} as {}", producer.id());
        slots.insert(kind, producer)
    }

    /// closes server side first. on failure the production stays in place
    async fn close_production(&self, slots: &mut ProducerSlots, kind: MediaKind) -> Result<(), Error> {
        let Some(producer) = slots.get(kind).cloned() else {
            return Ok(());
        };
        self.request(SfuRequest::CloseProducer {
            producer_id: producer.id().to_string(),
        })
        .await?;
        slots.take(kind);
        producer.close();
        log::debug!("closed {kind} production {}", producer.id());
        Ok(())
    }

    fn start_listener(&self) -> Result<(), Error> {
        let Some(mut signals) = self.inner.signals.lock().take() else {
            return Err(Error::OtherWithContext(
                "forwarding listener already started".into(),
            ));
        };

        let session = self.clone();
        let token = self.inner.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = signals.recv() => match res {
                        Ok(signal) => session.handle_signal(signal).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("forwarding listener skipped {n} signals");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            log::trace!("forwarding listener terminated");
        });
        *self.inner.listener.lock() = Some(handle);
        Ok(())
    }

    async fn handle_signal(&self, signal: ServerSignal) {
        if !signal.is_for(&self.inner.room_id, &self.inner.own_id) {
            return;
        }
        match signal {
            ServerSignal::NewProducer { producer, .. } => {
                // consumes run concurrently so a close for the same producer can cancel them
                let session = self.clone();
                tokio::spawn(async move {
                    let producer_id = producer.producer_id.clone();
                    if let Err(e) = session
                        .consume_producer(producer.producer_id, producer.owner_id)
                        .await
                    {
                        if !e.is_stale() {
                            log::error!("failed to consume {producer_id}: {e}");
                        }
                    }
                });
            }
            ServerSignal::ProducerClosed { producer_id, .. } => {
                self.on_producer_closed(&producer_id).await
            }
            ServerSignal::ParticipantLeft { participant_id, .. } => {
                self.on_peer_left(&participant_id)
            }
            _ => {}
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

fn release(consumer: Arc<dyn Consumer>) {
    consumer.track().stop();
    consumer.close();
}

fn unexpected(expected: ResponseKind, received: &SfuResponse) -> Error {
    Error::UnexpectedResponse {
        expected: expected.to_string(),
        received: received.kind().to_string(),
    }
}
