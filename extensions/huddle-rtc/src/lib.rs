//! A call coordinator for huddle built on the webrtc crate.
//!
//! [`SessionController::connect`] asks the room whether a selective forwarding server is
//! running. If it is, media goes up one send transport and comes down one receive transport;
//! otherwise every participant opens a direct connection to every other participant (the mesh).
//! Either way the UI sees the same [`huddle::call::CallEventStream`].
//!
//! The controller does not own a network connection. The embedding application supplies a
//! [`signaling::SignalingChannel`] for the room, a [`devices::MediaDevices`] for capture, and
//! factories for peer connections and the forwarding client device.
//!

pub mod controller;
pub mod correlation;
pub mod devices;
pub mod forwarding;
pub mod media_state;
pub mod mesh;
pub mod moderation;
pub mod probe;
pub mod signaling;
pub mod streams;

pub use controller::{CallDependencies, LocalCaptureSet, SessionController};
pub use huddle::call::CallSession;
