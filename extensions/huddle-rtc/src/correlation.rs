use std::time::Duration;

use huddle::{
    call::RoomId,
    error::Error,
    sync::Mutex,
};
use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::signaling::{
    ClientSignal, RequestId, ResponseKind, SfuRequest, SfuResponse, SignalingChannel,
};

struct PendingRequest {
    expected: ResponseKind,
    label: String,
    rsp: oneshot::Sender<SfuResponse>,
}

/// Matches responses from the forwarding server to the request that caused them.
///
/// Pending requests are kept in insertion order so a response that arrives without an
/// echoed request id resolves the oldest request expecting that kind of response. An error
/// without an id resolves the oldest pending request.
pub struct RequestTracker {
    pending: Mutex<IndexMap<RequestId, PendingRequest>>,
    timeout: Duration,
}

impl RequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(IndexMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request(
        &self,
        channel: &dyn SignalingChannel,
        room_id: &RoomId,
        request: SfuRequest,
        token: &CancellationToken,
    ) -> Result<SfuResponse, Error> {
        self.request_with_timeout(channel, room_id, request, self.timeout, token)
            .await
    }

    /// Sends `request` and waits for the matching response.
    ///
    /// Rejects with `RequestTimeout` when nothing arrives in time and with `RequestCancelled`
    /// when `token` is cancelled first. Either way the pending entry is removed, so a late
    /// response finds no listener.
    pub async fn request_with_timeout(
        &self,
        channel: &dyn SignalingChannel,
        room_id: &RoomId,
        request: SfuRequest,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<SfuResponse, Error> {
        if token.is_cancelled() {
            return Err(Error::RequestCancelled {
                request: request.to_string(),
            });
        }

        let request_id = Uuid::new_v4();
        let expected = request.expected_response();
        let label = request.to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            request_id,
            PendingRequest {
                expected,
                label: label.clone(),
                rsp: tx,
            },
        );

        if let Err(e) = channel.emit(ClientSignal::Request {
            room_id: room_id.clone(),
            request_id,
            request,
        }) {
            self.pending.lock().shift_remove(&request_id);
            return Err(Error::FailedToSendSignal(format!("{label}: {e}")));
        }

        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::RequestCancelled { request: label.clone() }),
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(Error::RequestCancelled { request: label.clone() }),
                Err(_) => Err(Error::RequestTimeout { request: label.clone() }),
            },
        };

        self.pending.lock().shift_remove(&request_id);

        let response = result?;
        match response {
            SfuResponse::Error { message } => Err(Error::ServerRejected(message)),
            response if response.kind() == expected => Ok(response),
            response => Err(Error::UnexpectedResponse {
                expected: expected.to_string(),
                received: response.kind().to_string(),
            }),
        }
    }

    /// Hands a response to its waiting request. Returns false if no pending request matched,
    /// in which case the response is dropped.
    pub fn resolve(&self, request_id: Option<RequestId>, response: SfuResponse) -> bool {
        let mut pending = self.pending.lock();
        let key = match request_id {
            Some(id) => pending.contains_key(&id).then_some(id),
            // an error names no kind, so it rejects the oldest request of any kind
            None => pending
                .iter()
                .find(|(_, p)| {
                    p.expected == response.kind() || response.kind() == ResponseKind::Error
                })
                .map(|(id, _)| *id),
        };

        let Some(entry) = key.and_then(|id| pending.shift_remove(&id)) else {
            log::debug!(
                "dropping {} response with no pending request",
                response.kind()
            );
            return false;
        };
        drop(pending);

        log::trace!("resolved {}", entry.label);
        entry.rsp.send(response).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// rejects every pending request with `RequestCancelled`
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}
