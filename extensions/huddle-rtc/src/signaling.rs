use std::collections::HashMap;

use derive_more::Display;
use futures::stream::BoxStream;
use futures::StreamExt;
use huddle::{
    call::{AccessGrant, MediaKind, ParticipantId, ParticipantState, RoomId},
    error::Error,
    sync::{Arc, Mutex},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::correlation::RequestTracker;

pub type RequestId = Uuid;
pub type ProducerId = String;
pub type TransportId = String;

/// opaque to this crate. produced and consumed by the forwarding primitives
pub type RtpCapabilities = serde_json::Value;
pub type RtpParameters = serde_json::Value;
pub type DtlsParameters = serde_json::Value;

/// The bidirectional event channel shared by everyone in the room. Its lifecycle is owned by
/// the embedding application.
pub trait SignalingChannel: Send + Sync {
    /// fire-and-forget
    fn emit(&self, signal: ClientSignal) -> Result<(), Error>;
    fn subscribe(&self) -> SignalStream;
}

pub struct SignalStream(pub BoxStream<'static, ServerSignal>);

impl core::ops::Deref for SignalStream {
    type Target = BoxStream<'static, ServerSignal>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SignalStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    #[display(fmt = "send")]
    Send,
    #[display(fmt = "recv")]
    Recv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: DtlsParameters,
}

/// a production that is active on the forwarding server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProducer {
    pub producer_id: ProducerId,
    pub owner_id: ParticipantId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerParameters {
    pub id: String,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Control requests sent to the forwarding server. Each is wrapped in
/// [`ClientSignal::Request`] with a fresh request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SfuRequest {
    #[display(fmt = "get_capabilities")]
    GetCapabilities,
    #[display(fmt = "join")]
    Join,
    #[display(fmt = "create_transport({})", direction)]
    CreateTransport { direction: TransportDirection },
    #[display(fmt = "connect_transport({})", transport_id)]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[display(fmt = "produce({})", kind)]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[display(fmt = "consume({})", producer_id)]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    #[display(fmt = "close_producer({})", producer_id)]
    CloseProducer { producer_id: ProducerId },
}

impl SfuRequest {
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            SfuRequest::GetCapabilities => ResponseKind::Capabilities,
            SfuRequest::Join => ResponseKind::Joined,
            SfuRequest::CreateTransport { .. } => ResponseKind::TransportCreated,
            SfuRequest::ConnectTransport { .. } => ResponseKind::TransportConnected,
            SfuRequest::Produce { .. } => ResponseKind::Produced,
            SfuRequest::Consume { .. } => ResponseKind::Consumed,
            SfuRequest::CloseProducer { .. } => ResponseKind::ProducerClosed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SfuResponse {
    Capabilities {
        running: bool,
        rtp_capabilities: RtpCapabilities,
    },
    Joined {
        participants: Vec<ParticipantId>,
        producers: Vec<RemoteProducer>,
        access: AccessGrant,
    },
    TransportCreated {
        transport: TransportParameters,
    },
    TransportConnected {
        transport_id: TransportId,
    },
    Produced {
        producer_id: ProducerId,
    },
    Consumed {
        consumer: ConsumerParameters,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    Error {
        message: String,
    },
}

impl SfuResponse {
    pub fn kind(&self) -> ResponseKind {
        match self {
            SfuResponse::Capabilities { .. } => ResponseKind::Capabilities,
            SfuResponse::Joined { .. } => ResponseKind::Joined,
            SfuResponse::TransportCreated { .. } => ResponseKind::TransportCreated,
            SfuResponse::TransportConnected { .. } => ResponseKind::TransportConnected,
            SfuResponse::Produced { .. } => ResponseKind::Produced,
            SfuResponse::Consumed { .. } => ResponseKind::Consumed,
            SfuResponse::ProducerClosed { .. } => ResponseKind::ProducerClosed,
            SfuResponse::Error { .. } => ResponseKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResponseKind {
    #[display(fmt = "capabilities")]
    Capabilities,
    #[display(fmt = "joined")]
    Joined,
    #[display(fmt = "transport_created")]
    TransportCreated,
    #[display(fmt = "transport_connected")]
    TransportConnected,
    #[display(fmt = "produced")]
    Produced,
    #[display(fmt = "consumed")]
    Consumed,
    #[display(fmt = "producer_closed")]
    ProducerClosed,
    #[display(fmt = "error")]
    Error,
}

/// Everything the local participant sends over the signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientSignal {
    #[display(fmt = "Request {}", request)]
    Request {
        room_id: RoomId,
        request_id: RequestId,
        request: SfuRequest,
    },
    /// voluntary leave of the forwarding session
    #[display(fmt = "ForwardingLeave")]
    ForwardingLeave { room_id: RoomId },
    /// join the mesh roster. answered with a roster snapshot
    #[display(fmt = "JoinCall")]
    JoinCall { room_id: RoomId },
    #[display(fmt = "LeaveCall")]
    LeaveCall { room_id: RoomId },
    #[display(fmt = "SessionDescription {}", target)]
    SessionDescription {
        room_id: RoomId,
        target: ParticipantId,
        description: SessionDescription,
    },
    #[display(fmt = "IceCandidate")]
    IceCandidate {
        room_id: RoomId,
        target: ParticipantId,
        candidate: IceCandidate,
    },
    #[display(fmt = "MediaState")]
    MediaState {
        room_id: RoomId,
        state: ParticipantState,
    },
    #[display(fmt = "ForceMute {}", target)]
    ForceMute {
        room_id: RoomId,
        target: ParticipantId,
    },
    #[display(fmt = "Remove {}", target)]
    Remove {
        room_id: RoomId,
        target: ParticipantId,
    },
}

/// Everything the room (or the forwarding server) pushes to the local participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerSignal {
    /// answer to a [`ClientSignal::Request`]. some servers omit the echoed id
    #[display(fmt = "Response")]
    Response {
        #[serde(default)]
        request_id: Option<RequestId>,
        response: SfuResponse,
    },
    #[display(fmt = "NewProducer")]
    NewProducer {
        room_id: RoomId,
        producer: RemoteProducer,
    },
    #[display(fmt = "ProducerClosed {}", producer_id)]
    ProducerClosed {
        room_id: RoomId,
        producer_id: ProducerId,
    },
    #[display(fmt = "ParticipantLeft {}", participant_id)]
    ParticipantLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    #[display(fmt = "MediaState {}", participant_id)]
    MediaState {
        room_id: RoomId,
        participant_id: ParticipantId,
        state: ParticipantState,
    },
    /// snapshot of everyone's media state, sent after joining
    #[display(fmt = "Joined")]
    Joined {
        room_id: RoomId,
        states: HashMap<ParticipantId, ParticipantState>,
        #[serde(default)]
        access: Option<AccessGrant>,
    },
    #[display(fmt = "ForceMuted {}", target)]
    ForceMuted {
        room_id: RoomId,
        target: ParticipantId,
    },
    #[display(fmt = "Removed {}", target)]
    Removed {
        room_id: RoomId,
        target: ParticipantId,
    },
    #[display(fmt = "Roster")]
    Roster {
        room_id: RoomId,
        participants: Vec<ParticipantId>,
    },
    #[display(fmt = "ParticipantJoined {}", participant_id)]
    ParticipantJoined {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    #[display(fmt = "SessionDescription {}", source)]
    SessionDescription {
        room_id: RoomId,
        source: ParticipantId,
        target: ParticipantId,
        description: SessionDescription,
    },
    #[display(fmt = "IceCandidate {}", source)]
    IceCandidate {
        room_id: RoomId,
        source: ParticipantId,
        target: ParticipantId,
        candidate: IceCandidate,
    },
}

impl ServerSignal {
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            ServerSignal::Response { .. } => None,
            ServerSignal::NewProducer { room_id, .. }
            | ServerSignal::ProducerClosed { room_id, .. }
            | ServerSignal::ParticipantLeft { room_id, .. }
            | ServerSignal::MediaState { room_id, .. }
            | ServerSignal::Joined { room_id, .. }
            | ServerSignal::ForceMuted { room_id, .. }
            | ServerSignal::Removed { room_id, .. }
            | ServerSignal::Roster { room_id, .. }
            | ServerSignal::ParticipantJoined { room_id, .. }
            | ServerSignal::SessionDescription { room_id, .. }
            | ServerSignal::IceCandidate { room_id, .. } => Some(room_id),
        }
    }

    /// false for events scoped to another room, or addressed to another participant
    pub fn is_for(&self, room_id: &RoomId, own_id: &ParticipantId) -> bool {
        if self.room_id().map_or(false, |id| id != room_id) {
            return false;
        }
        match self {
            ServerSignal::SessionDescription { target, .. }
            | ServerSignal::IceCandidate { target, .. } => target == own_id,
            _ => true,
        }
    }
}

pub fn encode<T: Serialize>(signal: &T) -> Result<String, Error> {
    serde_json::to_string(signal).map_err(Error::from)
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, Error> {
    serde_json::from_str(text).map_err(|e| Error::InvalidSignal(e.to_string()))
}

/// Reads the signaling channel once for the whole call. Responses are handed to the
/// [`RequestTracker`]; everything else is fanned out to subscribers.
pub struct SignalRouter {
    tx: broadcast::Sender<ServerSignal>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SignalRouter {
    pub fn spawn(stream: SignalStream, tracker: Arc<RequestTracker>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let tx = tx.clone();
            let token = token.clone();
            let mut stream = stream;
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        opt = stream.next() => {
                            let signal = match opt {
                                Some(s) => s,
                                None => {
                                    log::debug!("signaling channel closed");
                                    break;
                                }
                            };
                            match signal {
                                ServerSignal::Response { request_id, response } => {
                                    tracker.resolve(request_id, response);
                                }
                                other => {
                                    log::debug!("received signal: {other}");
                                    // no subscribers is fine
                                    let _ = tx.send(other);
                                }
                            }
                        }
                    }
                }
                log::trace!("signal router terminated");
            }
        });

        Self {
            tx,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// only signals received after subscribing are delivered
    pub fn subscribe(&self) -> broadcast::Receiver<ServerSignal> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.stop();
    }
}
