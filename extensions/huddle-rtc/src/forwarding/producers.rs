use std::collections::HashMap;

use huddle::{call::MediaKind, error::Error, sync::Arc};

use super::device::Producer;

/// At most one active production per kind
#[derive(Default)]
pub struct ProducerSlots {
    slots: HashMap<MediaKind, Arc<dyn Producer>>,
}

impl ProducerSlots {
    pub fn get(&self, kind: MediaKind) -> Option<&Arc<dyn Producer>> {
        self.slots.get(&kind)
    }

    pub fn insert(&mut self, kind: MediaKind, producer: Arc<dyn Producer>) -> Result<(), Error> {
        if self.slots.contains_key(&kind) {
            return Err(Error::OtherWithContext(format!(
                "{kind} production already active"
            )));
        }
        self.slots.insert(kind, producer);
        Ok(())
    }

    pub fn take(&mut self, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        self.slots.remove(&kind)
    }

    /// the kind of the local production with this id
    pub fn find(&self, producer_id: &str) -> Option<MediaKind> {
        self.slots
            .iter()
            .find(|(_, p)| p.id() == producer_id)
            .map(|(kind, _)| *kind)
    }

    /// camera and screen productions
    pub fn video_count(&self) -> usize {
        self.slots
            .keys()
            .filter(|k| matches!(k, MediaKind::Video | MediaKind::Screen))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Arc<dyn Producer>> {
        self.slots.drain().map(|(_, p)| p).collect()
    }
}
