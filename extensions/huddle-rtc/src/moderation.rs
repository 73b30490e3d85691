use huddle::{
    call::{AccessGrant, ParticipantId, RoomId},
    error::Error,
    sync::Arc,
};

use crate::signaling::{ClientSignal, ServerSignal, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationAction {
    ForceMute,
    Remove,
}

/// Host-only commands. The server enforces them; the local check only avoids sending a
/// request that is known to be refused.
pub struct Moderation {
    own_id: ParticipantId,
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
}

impl Moderation {
    pub fn new(own_id: ParticipantId, room_id: RoomId, signaling: Arc<dyn SignalingChannel>) -> Self {
        Self {
            own_id,
            room_id,
            signaling,
        }
    }

    pub fn force_mute(&self, grant: Option<&AccessGrant>, target: &ParticipantId) -> Result<(), Error> {
        Self::check_host(grant, "force mute")?;
        self.signaling.emit(ClientSignal::ForceMute {
            room_id: self.room_id.clone(),
            target: target.clone(),
        })
    }

    pub fn remove(&self, grant: Option<&AccessGrant>, target: &ParticipantId) -> Result<(), Error> {
        Self::check_host(grant, "remove")?;
        self.signaling.emit(ClientSignal::Remove {
            room_id: self.room_id.clone(),
            target: target.clone(),
        })
    }

    /// the action to apply locally, if `signal` is a moderation command aimed at us
    pub fn action_for(&self, signal: &ServerSignal) -> Option<ModerationAction> {
        match signal {
            ServerSignal::ForceMuted { room_id, target }
                if room_id == &self.room_id && target == &self.own_id =>
            {
                Some(ModerationAction::ForceMute)
            }
            ServerSignal::Removed { room_id, target }
                if room_id == &self.room_id && target == &self.own_id =>
            {
                Some(ModerationAction::Remove)
            }
            _ => None,
        }
    }

    // an unknown grant (mesh mode) is left to the server
    fn check_host(grant: Option<&AccessGrant>, action: &str) -> Result<(), Error> {
        match grant {
            Some(grant) if !grant.is_host() => Err(Error::NotPermitted(format!(
                "{action} requires the host role, local role is {}",
                grant.role
            ))),
            _ => Ok(()),
        }
    }
}
