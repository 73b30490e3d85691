use async_trait::async_trait;
use derive_more::Display;
use huddle::{
    call::{ParticipantId, TrackRef},
    error::Error,
    sync::Arc,
};
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};

/// identifies the sender a track was attached with, so it can be replaced later
pub type SenderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    #[display(fmt = "new")]
    New,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "closed")]
    Closed,
}

/// emitted by a peer connection's callbacks
#[derive(Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    Track(TrackRef),
    TrackEnded { track_id: String },
    StateChanged(ConnectionState),
}

/// Tags every event with the participant the connection belongs to
#[derive(Clone)]
pub struct PeerEventSink {
    peer: ParticipantId,
    tx: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(peer: ParticipantId, tx: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>) -> Self {
        Self { peer, tx }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn send(&self, event: PeerEvent) {
        if self.tx.send((self.peer.clone(), event)).is_err() {
            log::trace!("peer event for {} dropped: negotiator closed", self.peer);
        }
    }
}

/// One direct media connection to a remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: TrackRef) -> Result<SenderId, Error>;
    /// `None` detaches the track but keeps the sender for later reuse
    async fn replace_track(&self, sender: &SenderId, track: Option<TrackRef>) -> Result<(), Error>;
    async fn create_offer(&self) -> Result<SessionDescription, Error>;
    async fn create_answer(&self) -> Result<SessionDescription, Error>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error>;
}
