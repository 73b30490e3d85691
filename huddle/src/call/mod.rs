//! Call provides live audio/video/screen-share sessions between the participants of a channel.
//! An implementation should handle the following:
//! - choosing between a peer mesh and a selective forwarding server
//! - producing local microphone/camera/screen tracks and consuming remote ones
//! - broadcasting each participant's media state
//! - applying host moderation (force-mute, remove)
//!
use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;

mod access;
mod call_config;
mod call_state;
mod media;

pub use access::{AccessGrant, Role};
pub use call_config::CallConfig;
pub use call_state::{CallState, ParticipantState};
pub use media::{MediaKind, MediaTrack, RemoteStream, TrackKind, TrackRef};

/// Opaque participant identity. Ordering is used by mesh mode to pick the offer originator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display(fmt = "{}", _0)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The channel a call lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display(fmt = "{}", _0)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How media flows between participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// one direct connection to every other participant
    #[display(fmt = "mesh")]
    Mesh,
    /// one uplink and one downlink to a forwarding server
    #[display(fmt = "forwarding")]
    Forwarding,
}

/// Drives the call UI
#[async_trait]
pub trait CallSession: Send + Sync {
    // ------ Misc ------
    /// The event stream notifies the UI of call related events
    async fn get_event_stream(&self) -> Result<CallEventStream, Error>;

    // ------ Media controls ------

    /// returns whether the microphone is now transmitting
    async fn toggle_microphone(&self) -> Result<bool, Error>;
    /// returns whether the camera is now capturing
    async fn toggle_camera(&self) -> Result<bool, Error>;
    /// returns whether the screen is now shared
    async fn toggle_screen_share(&self) -> Result<bool, Error>;

    // ------ Moderation (host only) ------

    async fn force_mute(&self, target: &ParticipantId) -> Result<(), Error>;
    async fn remove(&self, target: &ParticipantId) -> Result<(), Error>;

    /// end/leave the current call. safe to call at any time, any number of times
    async fn disconnect(&self) -> Result<(), Error>;

    // ------ Utility Functions ------

    fn local_state(&self) -> ParticipantState;
    /// the last announced media state of a remote participant
    fn media_state(&self, participant: &ParticipantId) -> Option<ParticipantState>;
    /// None until the capability probe has completed
    fn topology(&self) -> Option<Topology>;
    fn is_active(&self) -> bool;
}

#[derive(Clone, Display)]
pub enum CallEventKind {
    #[display(fmt = "TopologySelected {}", topology)]
    TopologySelected { topology: Topology },
    #[display(fmt = "ParticipantJoined {}", participant_id)]
    ParticipantJoined { participant_id: ParticipantId },
    #[display(fmt = "ParticipantLeft {}", participant_id)]
    ParticipantLeft { participant_id: ParticipantId },
    /// mesh mode: the direct connection reached the connected state
    #[display(fmt = "ParticipantConnected {}", participant_id)]
    ParticipantConnected { participant_id: ParticipantId },
    #[display(fmt = "ConnectionFailed {}", participant_id)]
    ConnectionFailed { participant_id: ParticipantId },
    /// a participant's remote stream was created or gained/lost a track
    #[display(fmt = "StreamUpdated")]
    StreamUpdated { stream: RemoteStream },
    /// a participant's remote stream was destroyed
    #[display(fmt = "StreamRemoved {}", participant_id)]
    StreamRemoved { participant_id: ParticipantId },
    #[display(fmt = "MediaStateChanged {}", participant_id)]
    MediaStateChanged {
        participant_id: ParticipantId,
        state: ParticipantState,
    },
    #[display(fmt = "LocalMediaChanged")]
    LocalMediaChanged { state: ParticipantState },
    /// the host muted the local microphone
    #[display(fmt = "ForceMuted")]
    ForceMuted,
    /// the host removed the local participant from the call
    #[display(fmt = "RemovedFromCall")]
    RemovedFromCall,
    #[display(fmt = "DeviceUnavailable {}", kind)]
    DeviceUnavailable { kind: MediaKind },
    #[display(fmt = "CallEnded")]
    CallEnded,
}

// needed because RemoteStream holds trait objects
impl fmt::Debug for CallEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub struct CallEventStream(pub BoxStream<'static, CallEventKind>);

impl core::ops::Deref for CallEventStream {
    type Target = BoxStream<'static, CallEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
