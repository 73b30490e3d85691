use huddle::call::{MediaKind, ParticipantState, TrackRef};

/// The local microphone, camera and screen tracks. Owned by the controller; topologies only
/// ever borrow the tracks it hands them.
#[derive(Default)]
pub struct LocalCaptureSet {
    microphone: Option<TrackRef>,
    camera: Option<TrackRef>,
    screen: Option<TrackRef>,
}

impl LocalCaptureSet {
    pub fn get(&self, kind: MediaKind) -> Option<&TrackRef> {
        match kind {
            MediaKind::Audio => self.microphone.as_ref(),
            MediaKind::Video => self.camera.as_ref(),
            MediaKind::Screen => self.screen.as_ref(),
        }
    }

    /// returns the previous track, which the caller stops if it is done with it
    pub fn set(&mut self, kind: MediaKind, track: Option<TrackRef>) -> Option<TrackRef> {
        let slot = match kind {
            MediaKind::Audio => &mut self.microphone,
            MediaKind::Video => &mut self.camera,
            MediaKind::Screen => &mut self.screen,
        };
        std::mem::replace(slot, track)
    }

    /// a muted microphone keeps its track but is disabled
    pub fn microphone_on(&self) -> bool {
        self.microphone.as_ref().map_or(false, |t| t.is_enabled())
    }

    pub fn camera_on(&self) -> bool {
        self.camera.is_some()
    }

    pub fn screen_on(&self) -> bool {
        self.screen.is_some()
    }

    pub fn state(&self) -> ParticipantState {
        ParticipantState {
            audio: self.microphone_on(),
            video: self.camera_on(),
            screen: self.screen_on(),
        }
    }

    /// What each forwarding production slot should carry. The camera is withheld while the
    /// screen is shared.
    pub fn outgoing(&self, kind: MediaKind) -> Option<TrackRef> {
        match kind {
            MediaKind::Audio => self.microphone.clone().filter(|t| t.is_enabled()),
            MediaKind::Video if self.screen.is_some() => None,
            MediaKind::Video => self.camera.clone(),
            MediaKind::Screen => self.screen.clone(),
        }
    }

    /// the single video sender of a mesh connection: the screen if shared, else the camera
    pub fn outgoing_video(&self) -> Option<TrackRef> {
        self.screen.clone().or_else(|| self.camera.clone())
    }

    pub fn stop_all(&mut self) {
        for track in [
            self.microphone.take(),
            self.camera.take(),
            self.screen.take(),
        ]
        .into_iter()
        .flatten()
        {
            track.stop();
        }
    }
}
