#![allow(dead_code)]

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    future::Future,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use huddle::{
    call::{
        AccessGrant, CallConfig, CallEventKind, CallEventStream, MediaKind, MediaTrack,
        ParticipantId, RoomId, TrackKind, TrackRef,
    },
    error::Error,
    sync::{Arc, Mutex},
};
use huddle_rtc::{
    forwarding::{Consumer, Producer, SfuDevice, SfuTransport, TransportHandler},
    mesh::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SenderId},
    signaling::{
        ClientSignal, ConsumerParameters, IceCandidate, RemoteProducer, RequestId, ResponseKind,
        RtpCapabilities, ServerSignal, SessionDescription, SfuRequest, SfuResponse,
        SignalStream, SignalingChannel, TransportDirection, TransportParameters,
    },
    devices::MediaDevices,
    CallDependencies, SessionController,
};
use serde_json::json;
use tokio::sync::broadcast;

pub use tokio::time::timeout;

pub const ROOM: &str = "room";

pub fn config() -> CallConfig {
    CallConfig {
        probe_timeout_ms: 100,
        request_timeout_ms: 500,
        ..Default::default()
    }
}

/// polls `cond` until it holds or a second has passed
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// async variant of [`wait_until`]
pub async fn wait_until_async<F, Fut>(cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond().await
}

/// next event matching `pred`, skipping the rest
pub async fn next_event<F>(stream: &mut CallEventStream, pred: F) -> anyhow::Result<CallEventKind>
where
    F: Fn(&CallEventKind) -> bool,
{
    let event = timeout(Duration::from_secs(2), async {
        loop {
            match stream.next().await {
                Some(event) if pred(&event) => break Some(event),
                Some(_) => continue,
                None => break None,
            }
        }
    })
    .await?;
    event.ok_or_else(|| anyhow::anyhow!("event stream ended"))
}

/// every event already queued on the stream
pub async fn drain_events(stream: &mut CallEventStream) -> Vec<CallEventKind> {
    let mut events = vec![];
    while let Ok(Some(event)) = timeout(Duration::from_millis(50), stream.next()).await {
        events.push(event);
    }
    events
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst)
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst)
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture devices that hand out numbered fake tracks
#[derive(Default)]
pub struct FakeDevices {
    counter: AtomicUsize,
    pub unavailable: Mutex<HashSet<MediaKind>>,
    pub acquired: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub fn last(&self, kind: MediaKind) -> Option<Arc<FakeTrack>> {
        let prefix = format!("{kind}-");
        self.acquired
            .lock()
            .iter()
            .rev()
            .find(|t| t.id().starts_with(&prefix))
            .cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<TrackRef, Error> {
        if self.unavailable.lock().contains(&kind) {
            return Err(Error::DeviceUnavailable(format!("no {kind} device")));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let track = FakeTrack::new(format!("{kind}-{n}"), kind.track_kind());
        self.acquired.lock().push(track.clone());
        Ok(track)
    }
}

/// A scripted forwarding server. `running: None` never answers the capability probe.
pub struct FakeSfuServer {
    pub running: Option<bool>,
    pub participants: Vec<ParticipantId>,
    pub producers: Vec<RemoteProducer>,
    pub access: AccessGrant,
    /// requests expecting these responses are answered with an error
    pub reject: HashSet<ResponseKind>,
    /// requests expecting these responses wait for [`FakeSignaling::release`]
    pub hold: HashSet<ResponseKind>,
    pub requests: Vec<SfuRequest>,
    held: Vec<(RequestId, SfuRequest)>,
    kinds: HashMap<String, MediaKind>,
    next_producer: usize,
}

impl Default for FakeSfuServer {
    fn default() -> Self {
        Self {
            running: Some(true),
            participants: vec![],
            producers: vec![],
            access: AccessGrant::default(),
            reject: HashSet::new(),
            hold: HashSet::new(),
            requests: vec![],
            held: vec![],
            kinds: HashMap::new(),
            next_producer: 0,
        }
    }
}

impl FakeSfuServer {
    fn handle(&mut self, request_id: RequestId, request: SfuRequest) -> Option<SfuResponse> {
        self.requests.push(request.clone());
        let expected = request.expected_response();
        if matches!(request, SfuRequest::GetCapabilities) && self.running.is_none() {
            return None;
        }
        if self.hold.contains(&expected) {
            self.held.push((request_id, request));
            return None;
        }
        if self.reject.contains(&expected) {
            return Some(SfuResponse::Error {
                message: format!("{request} rejected"),
            });
        }
        Some(self.respond(request))
    }

    fn respond(&mut self, request: SfuRequest) -> SfuResponse {
        match request {
            SfuRequest::GetCapabilities => SfuResponse::Capabilities {
                running: self.running.unwrap_or(false),
                rtp_capabilities: json!({ "codecs": ["opus", "vp8"] }),
            },
            SfuRequest::Join => {
                for producer in &self.producers {
                    self.kinds
                        .insert(producer.producer_id.clone(), producer.kind);
                }
                SfuResponse::Joined {
                    participants: self.participants.clone(),
                    producers: self.producers.clone(),
                    access: self.access,
                }
            }
            SfuRequest::CreateTransport { direction } => SfuResponse::TransportCreated {
                transport: TransportParameters {
                    id: format!("{direction}-transport"),
                    ice_parameters: json!({}),
                    ice_candidates: json!([]),
                    dtls_parameters: json!({ "role": "auto" }),
                },
            },
            SfuRequest::ConnectTransport { transport_id, .. } => {
                SfuResponse::TransportConnected { transport_id }
            }
            SfuRequest::Produce { .. } => {
                self.next_producer += 1;
                SfuResponse::Produced {
                    producer_id: format!("p-{}", self.next_producer),
                }
            }
            SfuRequest::Consume { producer_id, .. } => SfuResponse::Consumed {
                consumer: ConsumerParameters {
                    id: format!("c-{producer_id}"),
                    kind: self
                        .kinds
                        .get(&producer_id)
                        .copied()
                        .unwrap_or(MediaKind::Audio),
                    producer_id,
                    rtp_parameters: json!({}),
                },
            },
            SfuRequest::CloseProducer { producer_id } => {
                SfuResponse::ProducerClosed { producer_id }
            }
        }
    }
}

/// The room's signaling channel. Requests are answered by the embedded [`FakeSfuServer`]
/// and a `JoinCall` is answered with the configured roster.
pub struct FakeSignaling {
    tx: broadcast::Sender<ServerSignal>,
    pub sent: Mutex<Vec<ClientSignal>>,
    pub sfu: Mutex<FakeSfuServer>,
    pub roster: Mutex<Vec<ParticipantId>>,
}

impl Default for FakeSignaling {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            sent: Mutex::new(vec![]),
            sfu: Mutex::new(FakeSfuServer::default()),
            roster: Mutex::new(vec![]),
        }
    }
}

impl FakeSignaling {
    pub fn push(&self, signal: ServerSignal) {
        let _ = self.tx.send(signal);
    }

    /// answers every held request expecting `kind`
    pub fn release(&self, kind: ResponseKind) {
        let responses: Vec<_> = {
            let mut sfu = self.sfu.lock();
            let held = std::mem::take(&mut sfu.held);
            let (release, keep): (Vec<_>, Vec<_>) = held
                .into_iter()
                .partition(|(_, r)| r.expected_response() == kind);
            sfu.held = keep;
            release
                .into_iter()
                .map(|(id, request)| (id, sfu.respond(request)))
                .collect()
        };
        for (request_id, response) in responses {
            self.push(ServerSignal::Response {
                request_id: Some(request_id),
                response,
            });
        }
    }

    /// the server announcing a production that started after we joined
    pub fn announce(&self, producer: RemoteProducer) {
        self.sfu
            .lock()
            .kinds
            .insert(producer.producer_id.clone(), producer.kind);
        self.push(ServerSignal::NewProducer {
            room_id: RoomId::from(ROOM),
            producer,
        });
    }

    pub fn close_producer(&self, producer_id: &str) {
        self.push(ServerSignal::ProducerClosed {
            room_id: RoomId::from(ROOM),
            producer_id: producer_id.into(),
        });
    }

    pub fn participant_left(&self, participant_id: &str) {
        self.push(ServerSignal::ParticipantLeft {
            room_id: RoomId::from(ROOM),
            participant_id: participant_id.into(),
        });
    }

    pub fn held_count(&self) -> usize {
        self.sfu.lock().held.len()
    }

    pub fn requests(&self) -> Vec<SfuRequest> {
        self.sfu.lock().requests.clone()
    }

    pub fn count_sent<F: Fn(&ClientSignal) -> bool>(&self, pred: F) -> usize {
        self.sent.lock().iter().filter(|s| pred(s)).count()
    }

    pub fn count_requests<F: Fn(&SfuRequest) -> bool>(&self, pred: F) -> usize {
        self.sfu.lock().requests.iter().filter(|r| pred(r)).count()
    }
}

impl SignalingChannel for FakeSignaling {
    fn emit(&self, signal: ClientSignal) -> Result<(), Error> {
        self.sent.lock().push(signal.clone());
        match signal {
            ClientSignal::Request {
                request_id,
                request,
                ..
            } => {
                let response = self.sfu.lock().handle(request_id, request);
                if let Some(response) = response {
                    self.push(ServerSignal::Response {
                        request_id: Some(request_id),
                        response,
                    });
                }
            }
            ClientSignal::JoinCall { room_id } => {
                let participants = self.roster.lock().clone();
                self.push(ServerSignal::Roster {
                    room_id,
                    participants,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn subscribe(&self) -> SignalStream {
        let mut rx = self.tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(signal) => yield signal,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                }
            }
        };
        SignalStream(Box::pin(stream))
    }
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    track: TrackRef,
    closed: AtomicBool,
}

impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn track(&self) -> TrackRef {
        self.track.clone()
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst)
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: Arc<FakeTrack>,
    closed: AtomicBool,
}

impl FakeConsumer {
    pub fn fake_track(&self) -> Arc<FakeTrack> {
        self.track.clone()
    }
}

impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }
    fn producer_id(&self) -> &str {
        &self.producer_id
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn track(&self) -> TrackRef {
        self.track.clone()
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst)
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connects once through its handler, then produces or consumes through it
pub struct FakeTransport {
    id: String,
    direction: TransportDirection,
    handler: Arc<dyn TransportHandler>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
    pub producers: Mutex<Vec<Arc<FakeProducer>>>,
    pub consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    async fn ensure_connected(&self) -> Result<(), Error> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.handler
                .on_connect(&self.id, json!({ "role": "client" }))
                .await?;
            *connected = true;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SfuTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    async fn produce(&self, track: TrackRef, kind: MediaKind) -> Result<Arc<dyn Producer>, Error> {
        if self.direction != TransportDirection::Send {
            return Err(Error::TransportError("not a send transport".into()));
        }
        self.ensure_connected().await?;
        let id = self.handler.on_produce(&self.id, kind, json!({})).await?;
        let producer = Arc::new(FakeProducer {
            id,
            kind,
            track,
            closed: AtomicBool::new(false),
        });
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, parameters: ConsumerParameters) -> Result<Arc<dyn Consumer>, Error> {
        if self.direction != TransportDirection::Recv {
            return Err(Error::TransportError("not a recv transport".into()));
        }
        self.ensure_connected().await?;
        let consumer = Arc::new(FakeConsumer {
            track: FakeTrack::new(
                format!("track-{}", parameters.producer_id),
                parameters.kind.track_kind(),
            ),
            id: parameters.id,
            producer_id: parameters.producer_id,
            kind: parameters.kind,
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeSfuDevice {
    loaded: Mutex<Option<RtpCapabilities>>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeSfuDevice {
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.direction == direction)
            .cloned()
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.transports
            .lock()
            .iter()
            .flat_map(|t| t.producers.lock().clone())
            .collect()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.transports
            .lock()
            .iter()
            .flat_map(|t| t.consumers.lock().clone())
            .collect()
    }
}

#[async_trait]
impl SfuDevice for FakeSfuDevice {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), Error> {
        *self.loaded.lock() = Some(router_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, Error> {
        self.loaded.lock().clone().ok_or(Error::CallNotInitialized)
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SfuTransport>, Error> {
        let transport = Arc::new(FakeTransport {
            id: parameters.id,
            direction,
            handler,
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Records every operation made on a mesh connection
pub struct FakePeer {
    next_sender: AtomicUsize,
    pub senders: Mutex<HashMap<SenderId, Option<String>>>,
    pub local_description: Mutex<Option<SessionDescription>>,
    pub remote_description: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    fn new() -> Self {
        Self {
            next_sender: AtomicUsize::new(0),
            senders: Mutex::new(HashMap::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        }
    }

    /// ids of the tracks currently attached to a sender
    pub fn attached(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.senders.lock().values().flatten().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: TrackRef) -> Result<SenderId, Error> {
        let sender = format!("s-{}", self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders
            .lock()
            .insert(sender.clone(), Some(track.id().to_string()));
        Ok(sender)
    }

    async fn replace_track(&self, sender: &SenderId, track: Option<TrackRef>) -> Result<(), Error> {
        match self.senders.lock().get_mut(sender) {
            Some(slot) => {
                *slot = track.map(|t| t.id().to_string());
                Ok(())
            }
            None => Err(Error::OtherWithContext(format!("unknown sender {sender}"))),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        if self.remote_description.lock().is_none() {
            return Err(Error::TransportError("no remote offer".into()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        if self.remote_description.lock().is_none() {
            return Err(Error::TransportError("candidate before description".into()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub peers: Mutex<HashMap<ParticipantId, Arc<FakePeer>>>,
    sinks: Mutex<HashMap<ParticipantId, PeerEventSink>>,
}

impl FakePeerFactory {
    pub fn peer(&self, id: &str) -> Option<Arc<FakePeer>> {
        self.peers.lock().get(&ParticipantId::from(id)).cloned()
    }

    /// simulates a callback from the connection to `id`
    pub fn fire(&self, id: &str, event: PeerEvent) {
        if let Some(sink) = self.sinks.lock().get(&ParticipantId::from(id)) {
            sink.send(event);
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        peer_id: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let peer = Arc::new(FakePeer::new());
        self.peers.lock().insert(peer_id.clone(), peer.clone());
        self.sinks.lock().insert(peer_id.clone(), events);
        Ok(peer)
    }
}

/// One participant's controller plus handles to every fake behind it
pub struct Harness {
    pub controller: SessionController,
    pub signaling: Arc<FakeSignaling>,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub sfu_device: Arc<FakeSfuDevice>,
}

impl Harness {
    /// a controller that can use the forwarding server
    pub fn new(own_id: &str) -> anyhow::Result<Self> {
        Self::build(own_id, true, config())
    }

    /// a controller without a forwarding client, so always mesh
    pub fn mesh_only(own_id: &str) -> anyhow::Result<Self> {
        Self::build(own_id, false, config())
    }

    pub fn build(own_id: &str, with_sfu: bool, config: CallConfig) -> anyhow::Result<Self> {
        let signaling = Arc::new(FakeSignaling::default());
        let devices = Arc::new(FakeDevices::default());
        let peers = Arc::new(FakePeerFactory::default());
        let sfu_device = Arc::new(FakeSfuDevice::default());

        let controller = SessionController::new(
            own_id.into(),
            RoomId::from(ROOM),
            config,
            CallDependencies {
                signaling: signaling.clone(),
                devices: devices.clone(),
                peer_factory: peers.clone(),
                sfu_device: with_sfu.then(|| sfu_device.clone() as Arc<dyn SfuDevice>),
            },
        )?;

        Ok(Self {
            controller,
            signaling,
            devices,
            peers,
            sfu_device,
        })
    }

    pub fn remote_producer(id: &str, owner: &str, kind: MediaKind) -> RemoteProducer {
        RemoteProducer {
            producer_id: id.into(),
            owner_id: owner.into(),
            kind,
        }
    }

    pub fn room() -> RoomId {
        RoomId::from(ROOM)
    }
}
