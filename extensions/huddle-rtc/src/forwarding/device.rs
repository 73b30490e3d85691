use async_trait::async_trait;
use huddle::{
    call::{MediaKind, TrackRef},
    error::Error,
    sync::Arc,
};

use crate::signaling::{
    ConsumerParameters, DtlsParameters, ProducerId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId, TransportParameters,
};

/// Callbacks a transport makes into the session client. Each one is a round trip to the
/// forwarding server.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// called once, before the first produce or consume, with the local security parameters.
    /// must complete only after the server acknowledged them
    async fn on_connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error>;

    /// returns the server assigned producer id
    async fn on_produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, Error>;
}

/// The local capability negotiator for the forwarding protocol
#[async_trait]
pub trait SfuDevice: Send + Sync {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), Error>;
    /// valid once loaded
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, Error>;
    async fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SfuTransport>, Error>;
}

#[async_trait]
pub trait SfuTransport: Send + Sync {
    fn id(&self) -> &str;
    fn direction(&self) -> TransportDirection;
    /// send transports only
    async fn produce(&self, track: TrackRef, kind: MediaKind) -> Result<Arc<dyn Producer>, Error>;
    /// recv transports only
    async fn consume(&self, parameters: ConsumerParameters) -> Result<Arc<dyn Consumer>, Error>;
    fn close(&self);
}

/// A local track being sent. Closing it does not stop the track.
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> TrackRef;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A remote production being received
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> TrackRef;
    fn close(&self);
    fn is_closed(&self) -> bool;
}
