use std::collections::{HashMap, HashSet};

use huddle::{
    call::{MediaKind, ParticipantId, RemoteStream},
    sync::Arc,
};

use super::device::Consumer;
use crate::{
    signaling::ProducerId,
    streams::{RemoteStreams, StreamChange},
};

pub enum Completion {
    /// the consumer is now tracked. `stream` is the owner's aggregate after the addition,
    /// or `None` if the track was already part of it
    Added {
        owner: ParticipantId,
        stream: Option<RemoteStream>,
    },
    /// the producer went away while the consume was in flight. close the consumer
    Cancelled(Arc<dyn Consumer>),
}

pub enum ProducerClosed {
    /// the consume is still in flight and will be cancelled when it completes
    Pending,
    Removed {
        consumer: Arc<dyn Consumer>,
        change: StreamChange,
    },
    Unknown,
}

pub struct PeerLeft {
    pub consumers: Vec<Arc<dyn Consumer>>,
    pub stream: Option<RemoteStream>,
}

/// Everything received from the forwarding server, keyed by remote producer id.
///
/// A producer id is consumed at most once. A consume is started with [`ConsumerTable::begin`]
/// and finished with [`ConsumerTable::complete`] or [`ConsumerTable::abort`]; close and leave
/// notifications that arrive in between mark it cancelled instead of being lost.
#[derive(Default)]
pub struct ConsumerTable {
    consumers: HashMap<ProducerId, Arc<dyn Consumer>>,
    owners: HashMap<ProducerId, ParticipantId>,
    kinds: HashMap<ProducerId, MediaKind>,
    in_flight: HashMap<ProducerId, ParticipantId>,
    cancelled: HashSet<ProducerId>,
    streams: RemoteStreams,
}

impl ConsumerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns false if the producer is already consumed or being consumed
    pub fn begin(&mut self, producer_id: &ProducerId, owner: &ParticipantId) -> bool {
        if self.consumers.contains_key(producer_id) || self.in_flight.contains_key(producer_id) {
            return false;
        }
        self.in_flight.insert(producer_id.clone(), owner.clone());
        true
    }

    pub fn complete(&mut self, producer_id: &ProducerId, consumer: Arc<dyn Consumer>) -> Completion {
        let Some(owner) = self.in_flight.remove(producer_id) else {
            return Completion::Cancelled(consumer);
        };
        if self.cancelled.remove(producer_id) {
            return Completion::Cancelled(consumer);
        }

        let track = consumer.track();
        self.kinds.insert(producer_id.clone(), consumer.kind());
        self.owners.insert(producer_id.clone(), owner.clone());
        self.consumers.insert(producer_id.clone(), consumer);
        let stream = self.streams.add_track(&owner, track);
        Completion::Added { owner, stream }
    }

    /// the consume failed. forget it so a later notification can retry
    pub fn abort(&mut self, producer_id: &ProducerId) {
        self.in_flight.remove(producer_id);
        self.cancelled.remove(producer_id);
    }

    pub fn on_producer_closed(&mut self, producer_id: &ProducerId) -> ProducerClosed {
        if self.in_flight.contains_key(producer_id) {
            self.cancelled.insert(producer_id.clone());
            return ProducerClosed::Pending;
        }

        let Some(consumer) = self.consumers.remove(producer_id) else {
            return ProducerClosed::Unknown;
        };
        self.kinds.remove(producer_id);
        let change = match self.owners.remove(producer_id) {
            Some(owner) => self.streams.remove_track(&owner, consumer.track().id()),
            None => StreamChange::Unchanged,
        };
        ProducerClosed::Removed { consumer, change }
    }

    /// drops every consumer of `owner` and takes its aggregate. the caller stops the tracks
    pub fn on_peer_left(&mut self, owner: &ParticipantId) -> PeerLeft {
        let producer_ids: Vec<ProducerId> = self
            .owners
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(id, _)| id.clone())
            .collect();

        let mut consumers = Vec::with_capacity(producer_ids.len());
        for id in producer_ids {
            self.owners.remove(&id);
            self.kinds.remove(&id);
            if let Some(consumer) = self.consumers.remove(&id) {
                consumers.push(consumer);
            }
        }

        for (id, o) in &self.in_flight {
            if o == owner {
                self.cancelled.insert(id.clone());
            }
        }

        PeerLeft {
            consumers,
            stream: self.streams.remove_owner(owner),
        }
    }

    /// empties the table. in-flight consumes complete as cancelled
    pub fn clear(&mut self) -> (Vec<Arc<dyn Consumer>>, Vec<RemoteStream>) {
        self.owners.clear();
        self.kinds.clear();
        self.in_flight.clear();
        self.cancelled.clear();
        let consumers = self.consumers.drain().map(|(_, c)| c).collect();
        (consumers, self.streams.drain())
    }

    pub fn is_consumed(&self, producer_id: &str) -> bool {
        self.consumers.contains_key(producer_id)
    }

    pub fn is_pending(&self, producer_id: &str) -> bool {
        self.in_flight.contains_key(producer_id)
    }

    pub fn owner(&self, producer_id: &str) -> Option<&ParticipantId> {
        self.owners.get(producer_id)
    }

    pub fn kind(&self, producer_id: &str) -> Option<MediaKind> {
        self.kinds.get(producer_id).copied()
    }

    pub fn stream(&self, owner: &ParticipantId) -> Option<&RemoteStream> {
        self.streams.get(owner)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use huddle::call::TrackRef;

    use super::*;
    use crate::streams::test::TestTrack;

    struct TestConsumer {
        id: String,
        producer_id: String,
        kind: MediaKind,
        track: TrackRef,
        closed: AtomicBool,
    }

    impl Consumer for TestConsumer {
        fn id(&self) -> &str {
            &self.id
        }
        fn producer_id(&self) -> &str {
            &self.producer_id
        }
        fn kind(&self) -> MediaKind {
            self.kind
        }
        fn track(&self) -> TrackRef {
            self.track.clone()
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn consumer(producer_id: &str, kind: MediaKind) -> Arc<dyn Consumer> {
        Arc::new(TestConsumer {
            id: format!("c-{producer_id}"),
            producer_id: producer_id.into(),
            kind,
            track: TestTrack::new(&format!("t-{producer_id}")),
            closed: AtomicBool::new(false),
        })
    }

    fn consume(table: &mut ConsumerTable, producer_id: &str, owner: &str) -> Completion {
        let pid = ProducerId::from(producer_id);
        assert!(table.begin(&pid, &owner.into()));
        table.complete(&pid, consumer(producer_id, MediaKind::Audio))
    }

    #[test]
    fn producer_is_consumed_once() {
        let mut table = ConsumerTable::new();
        let pid = ProducerId::from("p1");
        let alice = ParticipantId::from("alice");

        assert!(table.begin(&pid, &alice));
        assert!(!table.begin(&pid, &alice));
        assert!(matches!(
            table.complete(&pid, consumer("p1", MediaKind::Audio)),
            Completion::Added { stream: Some(_), .. }
        ));
        assert!(!table.begin(&pid, &alice));
        assert_eq!(table.len(), 1);
        assert_eq!(table.owner("p1"), Some(&alice));
        assert_eq!(table.kind("p1"), Some(MediaKind::Audio));
    }

    #[test]
    fn close_before_consume_completes_cancels_it() {
        let mut table = ConsumerTable::new();
        let pid = ProducerId::from("p1");
        assert!(table.begin(&pid, &"alice".into()));

        assert!(matches!(table.on_producer_closed(&pid), ProducerClosed::Pending));
        assert!(matches!(
            table.complete(&pid, consumer("p1", MediaKind::Video)),
            Completion::Cancelled(_)
        ));
        assert!(table.is_empty());
        assert_eq!(table.stream_count(), 0);
    }

    #[test]
    fn close_after_consume_removes_track_then_stream() {
        let mut table = ConsumerTable::new();
        consume(&mut table, "p1", "alice");
        consume(&mut table, "p2", "alice");

        match table.on_producer_closed(&"p1".into()) {
            ProducerClosed::Removed {
                change: StreamChange::Updated(stream),
                ..
            } => assert_eq!(stream.len(), 1),
            _ => panic!("expected updated stream"),
        }
        assert!(matches!(
            table.on_producer_closed(&"p2".into()),
            ProducerClosed::Removed {
                change: StreamChange::Removed(_),
                ..
            }
        ));
        assert!(matches!(
            table.on_producer_closed(&"p2".into()),
            ProducerClosed::Unknown
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn peer_left_and_producer_closed_in_either_order() {
        let mut table = ConsumerTable::new();
        consume(&mut table, "p1", "alice");
        consume(&mut table, "p2", "bob");

        let left = table.on_peer_left(&"alice".into());
        assert_eq!(left.consumers.len(), 1);
        assert!(left.stream.is_some());
        assert!(matches!(
            table.on_producer_closed(&"p1".into()),
            ProducerClosed::Unknown
        ));

        assert!(matches!(
            table.on_producer_closed(&"p2".into()),
            ProducerClosed::Removed {
                change: StreamChange::Removed(_),
                ..
            }
        ));
        let left = table.on_peer_left(&"bob".into());
        assert!(left.consumers.is_empty());
        assert!(left.stream.is_none());
    }

    #[test]
    fn peer_left_cancels_in_flight_consumes() {
        let mut table = ConsumerTable::new();
        let pid = ProducerId::from("p1");
        assert!(table.begin(&pid, &"alice".into()));
        table.on_peer_left(&"alice".into());
        assert!(matches!(
            table.complete(&pid, consumer("p1", MediaKind::Audio)),
            Completion::Cancelled(_)
        ));
    }

    #[test]
    fn failed_consume_can_be_retried() {
        let mut table = ConsumerTable::new();
        let pid = ProducerId::from("p1");
        assert!(table.begin(&pid, &"alice".into()));
        table.abort(&pid);
        assert!(!table.is_pending("p1"));
        assert!(table.begin(&pid, &"alice".into()));
    }

    #[test]
    fn clear_returns_everything() {
        let mut table = ConsumerTable::new();
        consume(&mut table, "p1", "alice");
        consume(&mut table, "p2", "bob");
        let (consumers, streams) = table.clear();
        assert_eq!(consumers.len(), 2);
        assert_eq!(streams.len(), 2);
        assert!(table.is_empty());
        assert!(consumers.iter().all(|c| !c.track().is_stopped()));
    }
}
