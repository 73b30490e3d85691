//! Shared call types for huddle.
//!
//! This crate holds what the UI and the call coordinator agree on: participant ids, media
//! kinds, tracks and remote streams, the per-participant media state record, access grants,
//! call configuration, the UI event stream and the [`call::CallSession`] trait. The
//! coordinator itself lives in the `huddle-rtc` extension.

pub mod sync {
    pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
    pub use std::sync::Arc;
}

pub mod call;
pub mod error;
