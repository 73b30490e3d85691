use std::time::Duration;

use huddle::call::{RoomId, Topology};
use tokio_util::sync::CancellationToken;

use crate::{
    correlation::RequestTracker,
    signaling::{RtpCapabilities, SfuRequest, SfuResponse, SignalingChannel},
};

/// Whether a usable forwarding server answered for the room
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEngineAvailability {
    pub available: bool,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

impl MediaEngineAvailability {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            rtp_capabilities: None,
        }
    }

    pub fn topology(&self) -> Topology {
        if self.available {
            Topology::Forwarding
        } else {
            Topology::Mesh
        }
    }
}

/// Asks the room for the forwarding capability descriptor, once per call.
/// A timeout, an error response or an engine that reports it is not running all count as
/// unavailable.
pub async fn probe(
    tracker: &RequestTracker,
    channel: &dyn SignalingChannel,
    room_id: &RoomId,
    timeout: Duration,
    token: &CancellationToken,
) -> MediaEngineAvailability {
    let response = tracker
        .request_with_timeout(channel, room_id, SfuRequest::GetCapabilities, timeout, token)
        .await;

    match response {
        Ok(SfuResponse::Capabilities {
            running: true,
            rtp_capabilities,
        }) => MediaEngineAvailability {
            available: true,
            rtp_capabilities: Some(rtp_capabilities),
        },
        Ok(_) => {
            log::debug!("forwarding engine is not running in {room_id}");
            MediaEngineAvailability::unavailable()
        }
        Err(e) => {
            log::debug!("capability probe for {room_id} failed: {e}");
            MediaEngineAvailability::unavailable()
        }
    }
}
