//! webrtc-rs backed peer connections.
//!
//! Transforming audio/video into RTP packets is the caller's responsibility: local tracks
//! handed to the mesh must be [`RtcLocalTrack`]s, whose `rtp_track()` the capture pipeline
//! writes to. Remote tracks surface as [`RtcRemoteTrack`]s; the connection reads their RTP
//! and fans it out to [`RtcRemoteTrack::subscribe`]rs until the remote side ends the track.

use std::{
    any::Any,
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use huddle::{
    call::{CallConfig, MediaTrack, ParticipantId, TrackKind, TrackRef},
    error::Error,
    sync::{Arc, Mutex},
};
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp::packet::Packet,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        RTCRtpTransceiver,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
        track_remote::TrackRemote,
    },
};

use super::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SenderId,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// A local track the mesh can attach to webrtc-rs connections
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticRTP>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    pub fn new(kind: TrackKind, codec: RTCRtpCodecCapability) -> Self {
        let id = Uuid::new_v4().to_string();
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec,
            id.clone(),
            Uuid::new_v4().to_string(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// the RTP sink. writers should skip packets while the track is disabled
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed)
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed)
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

const REMOTE_PACKET_BUFFER: usize = 256;

pub struct RtcRemoteTrack {
    id: String,
    kind: TrackKind,
    packets: broadcast::Sender<Packet>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcRemoteTrack {
    fn new(id: String, kind: TrackKind) -> Self {
        let (packets, _) = broadcast::channel(REMOTE_PACKET_BUFFER);
        Self {
            id,
            kind,
            packets,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// RTP packets received on this track. Nothing is delivered while the track is disabled.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.packets.subscribe()
    }
}

impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed)
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed)
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Forwards `packets` to the track's subscribers. When the remote side ends the track,
/// reports `TrackEnded` unless the track was stopped locally first.
async fn forward_rtp<S>(track: Arc<RtcRemoteTrack>, packets: S, sink: PeerEventSink)
where
    S: Stream<Item = Packet> + Send,
{
    let mut packets = Box::pin(packets);
    while let Some(packet) = packets.next().await {
        if track.is_stopped() {
            return;
        }
        if track.is_enabled() {
            // no subscribers is fine
            let _ = track.packets.send(packet);
        }
    }
    if track.is_stopped() {
        return;
    }
    log::debug!("remote track {} from {} ended", track.id(), sink.peer());
    sink.send(PeerEvent::TrackEnded {
        track_id: track.id().to_string(),
    });
}

fn rtp_packets(remote: Arc<TrackRemote>) -> impl Stream<Item = Packet> + Send {
    futures::stream::unfold(remote, |remote| async move {
        match remote.read_rtp().await {
            Ok((packet, _)) => Some((packet, remote)),
            Err(e) => {
                log::trace!("stopped reading remote track {}: {e}", remote.id());
                None
            }
        }
    })
}

struct RtcRtpManager {
    sender: Arc<RTCRtpSender>,
    handle: JoinHandle<()>,
}

impl Drop for RtcRtpManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, Error> {
        Ok(Self {
            api: create_api()?,
            ice_servers,
        })
    }

    /// uses the ICE servers from the call configuration
    pub fn from_config(config: &CallConfig) -> Result<Self, Error> {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        peer_id: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("failed to create peer connection")?,
        );

        let sink = events.clone();
        connection.on_peer_connection_state_change(Box::new(move |c: RTCPeerConnectionState| {
            let state = match c {
                RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                    ConnectionState::New
                }
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            sink.send(PeerEvent::StateChanged(state));
            Box::pin(futures::future::ready(()))
        }));

        let sink = events.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => sink.send(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => log::error!("failed to serialize ice candidate for {}: {e}", sink.peer()),
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let sink = events;
        let readers = Arc::new(Mutex::new(Vec::new()));
        let track_readers = readers.clone();
        connection.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match remote.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let track = Arc::new(RtcRemoteTrack::new(remote.id(), kind));
                let reader = tokio::spawn(forward_rtp(
                    track.clone(),
                    rtp_packets(remote),
                    sink.clone(),
                ));
                track_readers.lock().push(reader);
                sink.send(PeerEvent::Track(track));
                Box::pin(futures::future::ready(()))
            },
        ));

        log::debug!("created peer connection for {peer_id}");
        Ok(Arc::new(RtcPeer {
            connection,
            senders: Mutex::new(HashMap::new()),
            readers,
        }))
    }
}

struct RtcPeer {
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, RtcRtpManager>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

fn local_rtp_track(track: &TrackRef) -> Result<Arc<dyn TrackLocal + Send + Sync>, Error> {
    track
        .as_any()
        .downcast_ref::<RtcLocalTrack>()
        .map(|t| t.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| Error::TransportError(format!("track {} is not an RTP track", track.id())))
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| Error::InvalidSignal(e.to_string()))
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: TrackRef) -> Result<SenderId, Error> {
        let rtp_track = local_rtp_track(&track)?;
        let sender = self
            .connection
            .add_track(rtp_track)
            .await
            .context("add_track failed")?;

        // Read incoming RTCP packets
        // Before these packets are returned they are processed by interceptors. For things
        // like NACK this needs to be called.
        let reader = sender.clone();
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = reader.read(&mut rtcp_buf).await {}
            log::debug!("terminating rtp_sender thread");
        });

        let sender_id = track.id().to_string();
        self.senders
            .lock()
            .insert(sender_id.clone(), RtcRtpManager { sender, handle });
        Ok(sender_id)
    }

    async fn replace_track(&self, sender: &SenderId, track: Option<TrackRef>) -> Result<(), Error> {
        let rtp_sender = self
            .senders
            .lock()
            .get(sender)
            .map(|m| m.sender.clone())
            .ok_or_else(|| Error::TransportError(format!("unknown sender {sender}")))?;
        let rtp_track = track.as_ref().map(local_rtp_track).transpose()?;
        rtp_sender
            .replace_track(rtp_track)
            .await
            .context("replace_track failed")?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .context("create_offer failed")?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .context("create_answer failed")?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error> {
        // Note: this will start the gathering of ICE candidates
        self.connection
            .set_local_description(to_rtc(description)?)
            .await
            .context("set_local_description failed")?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await
            .context("set_remote_description failed")?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .context("add_ice_candidate failed")?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.senders.lock().clear();
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        self.connection
            .close()
            .await
            .map_err(|e| Error::from(anyhow!("failed to close peer connection: {e}")))
    }
}

fn create_api() -> Result<API, Error> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .context("failed to register codecs")?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features. If you use `webrtc.NewPeerConnection`
    // this is enabled by default. If you are manually managing You MUST create a InterceptorRegistry
    // for each PeerConnection.
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .context("failed to register interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
