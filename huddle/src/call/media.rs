use std::{any::Any, fmt, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// What a single track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// A logical outgoing media slot. Camera and screen are both video tracks but occupy
/// different slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
    #[display(fmt = "screen")]
    Screen,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Audio, MediaKind::Video, MediaKind::Screen];

    pub fn track_kind(&self) -> TrackKind {
        match self {
            MediaKind::Audio => TrackKind::Audio,
            MediaKind::Video | MediaKind::Screen => TrackKind::Video,
        }
    }
}

/// A local capture track or a received remote track.
///
/// Implementations wrap whatever the platform provides (a webrtc-rs track, a capture device
/// handle, a test double). `stop` releases the underlying source and must be idempotent.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    /// a disabled track stays attached but transmits silence/black frames
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

pub type TrackRef = Arc<dyn MediaTrack>;

/// Every track currently receivable from one participant.
#[derive(Clone)]
pub struct RemoteStream {
    participant_id: ParticipantId,
    tracks: Vec<TrackRef>,
}

impl RemoteStream {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            tracks: vec![],
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    /// returns false if a track with the same id is already present
    pub fn add_track(&mut self, track: TrackRef) -> bool {
        if self.contains(track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<TrackRef> {
        let idx = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(idx))
    }

    /// stops every track and empties the stream
    pub fn stop_all(&mut self) {
        for track in self.tracks.drain(..) {
            track.stop();
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("participant_id", &self.participant_id)
            .field("tracks", &self.track_ids())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Dummy {
        id: String,
        stopped: AtomicBool,
    }

    impl MediaTrack for Dummy {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> TrackKind {
            TrackKind::Audio
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn set_enabled(&self, _enabled: bool) {}
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn dummy(id: &str) -> Arc<Dummy> {
        Arc::new(Dummy {
            id: id.into(),
            stopped: AtomicBool::new(false),
        })
    }

    #[test]
    fn stream_ignores_duplicate_track_ids() {
        let mut stream = RemoteStream::new("alice".into());
        assert!(stream.add_track(dummy("a1")));
        assert!(!stream.add_track(dummy("a1")));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn stop_all_stops_and_empties() {
        let mut stream = RemoteStream::new("alice".into());
        let t1 = dummy("a1");
        let t2 = dummy("v1");
        stream.add_track(t1.clone());
        stream.add_track(t2.clone());
        assert!(stream.remove_track("missing").is_none());

        stream.stop_all();
        assert!(stream.is_empty());
        assert!(t1.is_stopped() && t2.is_stopped());
    }

    #[test]
    fn screen_is_a_video_track() {
        assert_eq!(MediaKind::Screen.track_kind(), TrackKind::Video);
        assert_eq!(MediaKind::Audio.track_kind(), TrackKind::Audio);
    }
}
