//! Errors produced while coordinating a call session
use thiserror::Error;

#[allow(clippy::large_enum_variant)]
#[derive(Error, Debug)]
pub enum Error {
    //Session Errors
    #[error("CallNotInitialized")]
    CallNotInitialized,
    #[error("CallAlreadyInProgress")]
    CallAlreadyInProgress,
    /// Neither the mesh nor the forwarding topology could be established
    #[error("CallUnavailable: {_0}")]
    CallUnavailable(String),
    /// An async step finished after the session that started it was closed
    #[error("SessionClosed")]
    SessionClosed,

    //Signaling Errors
    #[error("FailedToSendSignal: {_0}")]
    FailedToSendSignal(String),
    #[error("Invalid signal: {_0}")]
    InvalidSignal(String),
    #[error("Request '{request}' timed out")]
    RequestTimeout { request: String },
    #[error("Request '{request}' was cancelled")]
    RequestCancelled { request: String },
    #[error("Expected response '{expected}', received '{received}'")]
    UnexpectedResponse { expected: String, received: String },
    #[error("Server rejected request: {_0}")]
    ServerRejected(String),

    //Media Errors
    #[error("Forwarding media engine is unavailable")]
    MediaEngineUnavailable,
    #[error("Capture device unavailable: {_0}")]
    DeviceUnavailable(String),
    #[error("Transport error: {_0}")]
    TransportError(String),
    #[error("Peer not found: {_0}")]
    PeerNotFound(String),
    #[error("Not permitted: {_0}")]
    NotPermitted(String),

    //Config Errors
    #[error("Invalid config: {_0}")]
    InvalidConfig(String),

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("{0}")]
    TomlError(#[from] toml::de::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("An unknown error has occurred")]
    Other,
}

impl Error {
    /// True for the errors that only mean "the session went away underneath the operation"
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Error::SessionClosed | Error::RequestCancelled { .. }
        )
    }
}
