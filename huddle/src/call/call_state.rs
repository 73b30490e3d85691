use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// Which of a participant's media are enabled. Always sent as the full triple.
#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParticipantState {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

impl ParticipantState {
    pub fn muted(&self) -> bool {
        !self.audio
    }
}

/// Local record plus a cached mirror of every other participant's last announcement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallState {
    pub own_id: ParticipantId,
    pub own_state: ParticipantState,
    pub participants: HashMap<ParticipantId, ParticipantState>,
}

impl CallState {
    pub fn new(own_id: ParticipantId) -> Self {
        Self {
            own_id,
            own_state: ParticipantState::default(),
            participants: HashMap::default(),
        }
    }

    /// overwrites the cached record wholesale. returns false if nothing changed.
    /// announcements about the local participant are ignored; the local record is authoritative.
    pub fn set_participant(&mut self, id: &ParticipantId, state: ParticipantState) -> bool {
        if id == &self.own_id {
            return false;
        }
        self.participants.insert(id.clone(), state) != Some(state)
    }

    /// merges a snapshot of many participants. returns the ids whose record changed.
    pub fn merge<I>(&mut self, states: I) -> Vec<ParticipantId>
    where
        I: IntoIterator<Item = (ParticipantId, ParticipantState)>,
    {
        states
            .into_iter()
            .filter_map(|(id, state)| self.set_participant(&id, state).then_some(id))
            .collect()
    }

    pub fn remove_participant(&mut self, id: &ParticipantId) -> Option<ParticipantState> {
        self.participants.remove(id)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<ParticipantState> {
        self.participants.get(id).copied()
    }

    pub fn is_call_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// returns false if nothing changed
    pub fn set_self(&mut self, state: ParticipantState) -> bool {
        std::mem::replace(&mut self.own_state, state) != state
    }

    pub fn set_self_muted(&mut self, muted: bool) -> bool {
        let mut state = self.own_state;
        state.audio = !muted;
        self.set_self(state)
    }

    pub fn reset(&mut self) {
        self.own_state = ParticipantState::default();
        self.participants.clear();
    }
}
