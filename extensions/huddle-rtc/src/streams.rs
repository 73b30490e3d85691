use std::collections::HashMap;

use huddle::call::{CallEventKind, ParticipantId, RemoteStream, TrackRef};

/// Result of removing a track from an owner's aggregate
#[derive(Debug)]
pub enum StreamChange {
    /// the track was not part of any aggregate
    Unchanged,
    /// the aggregate still has tracks
    Updated(RemoteStream),
    /// the last track was removed and the aggregate destroyed
    Removed(ParticipantId),
}

impl StreamChange {
    pub fn into_event(self) -> Option<CallEventKind> {
        match self {
            StreamChange::Unchanged => None,
            StreamChange::Updated(stream) => Some(CallEventKind::StreamUpdated { stream }),
            StreamChange::Removed(participant_id) => {
                Some(CallEventKind::StreamRemoved { participant_id })
            }
        }
    }
}

/// One aggregate stream per remote participant. An aggregate exists only while it holds at
/// least one track.
#[derive(Default)]
pub struct RemoteStreams {
    streams: HashMap<ParticipantId, RemoteStream>,
}

impl RemoteStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the owner's aggregate if the track was added. Creates the
    /// aggregate on first track.
    pub fn add_track(&mut self, owner: &ParticipantId, track: TrackRef) -> Option<RemoteStream> {
        let stream = self
            .streams
            .entry(owner.clone())
            .or_insert_with(|| RemoteStream::new(owner.clone()));
        stream.add_track(track).then(|| stream.clone())
    }

    /// Removes a track without stopping it
    pub fn remove_track(&mut self, owner: &ParticipantId, track_id: &str) -> StreamChange {
        let Some(stream) = self.streams.get_mut(owner) else {
            return StreamChange::Unchanged;
        };
        if stream.remove_track(track_id).is_none() {
            return StreamChange::Unchanged;
        }
        if stream.is_empty() {
            self.streams.remove(owner);
            return StreamChange::Removed(owner.clone());
        }
        StreamChange::Updated(stream.clone())
    }

    /// Takes the owner's whole aggregate. The caller stops its tracks.
    pub fn remove_owner(&mut self, owner: &ParticipantId) -> Option<RemoteStream> {
        self.streams.remove(owner)
    }

    pub fn get(&self, owner: &ParticipantId) -> Option<&RemoteStream> {
        self.streams.get(owner)
    }

    pub fn contains(&self, owner: &ParticipantId) -> bool {
        self.streams.contains_key(owner)
    }

    pub fn drain(&mut self) -> Vec<RemoteStream> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
