use async_trait::async_trait;
use huddle::{
    call::{MediaKind, TrackRef},
    error::Error,
};

/// Local capture sources. `MediaKind::Video` is the camera and `MediaKind::Screen` a display
/// capture. Each call acquires a new track owned by the caller.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<TrackRef, Error>;
}
