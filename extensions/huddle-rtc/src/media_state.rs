use std::collections::HashMap;

use huddle::{
    call::{CallEventKind, CallState, ParticipantId, ParticipantState, RoomId},
    sync::{Arc, RwLock},
};
use tokio::sync::broadcast;

use crate::signaling::{ClientSignal, SignalingChannel};

/// Publishes the local media flags and mirrors everyone else's. Purely informational: sends
/// are fire-and-forget and stale records are tolerated.
pub struct MediaStateSync {
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
    state: RwLock<CallState>,
    ui_event_ch: broadcast::Sender<CallEventKind>,
}

impl MediaStateSync {
    pub fn new(
        own_id: ParticipantId,
        room_id: RoomId,
        signaling: Arc<dyn SignalingChannel>,
        ui_event_ch: broadcast::Sender<CallEventKind>,
    ) -> Self {
        Self {
            room_id,
            signaling,
            state: RwLock::new(CallState::new(own_id)),
            ui_event_ch,
        }
    }

    /// sends the local state if it differs from the last one published
    pub fn publish(&self, state: ParticipantState) -> bool {
        if !self.state.write().set_self(state) {
            return false;
        }
        self.send(state);
        true
    }

    /// sends the local state unconditionally. used right after joining
    pub fn announce(&self) {
        let state = self.local_state();
        self.send(state);
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        let state = {
            let mut call = self.state.write();
            if !call.set_self_muted(muted) {
                return false;
            }
            call.own_state
        };
        self.send(state);
        true
    }

    pub fn on_remote_update(&self, participant_id: &ParticipantId, state: ParticipantState) {
        if self.state.write().set_participant(participant_id, state) {
            self.emit(CallEventKind::MediaStateChanged {
                participant_id: participant_id.clone(),
                state,
            });
        }
    }

    pub fn on_joined_snapshot(&self, states: HashMap<ParticipantId, ParticipantState>) {
        let changed: Vec<_> = {
            let mut call = self.state.write();
            let ids = call.merge(states);
            ids.into_iter()
                .filter_map(|id| call.participant(&id).map(|state| (id, state)))
                .collect()
        };
        for (participant_id, state) in changed {
            self.emit(CallEventKind::MediaStateChanged {
                participant_id,
                state,
            });
        }
    }

    pub fn on_participant_left(&self, participant_id: &ParticipantId) {
        self.state.write().remove_participant(participant_id);
    }

    pub fn local_state(&self) -> ParticipantState {
        self.state.read().own_state
    }

    pub fn participant(&self, participant_id: &ParticipantId) -> Option<ParticipantState> {
        self.state.read().participant(participant_id)
    }

    pub fn reset(&self) {
        self.state.write().reset();
    }

    fn send(&self, state: ParticipantState) {
        self.emit(CallEventKind::LocalMediaChanged { state });
        if let Err(e) = self.signaling.emit(ClientSignal::MediaState {
            room_id: self.room_id.clone(),
            state,
        }) {
            log::error!("failed to publish media state: {e}");
        }
    }

    fn emit(&self, event: CallEventKind) {
        let _ = self.ui_event_ch.send(event);
    }
}
