//! Recording sink - keeps every published event for later assertions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use whofi_core::{FeedEvent, TrackSnapshot};
use whofi_env::{EntityId, EnvError, SnapshotSink};

/// Unbounded, non-coalescing sink.
///
/// Unlike [`whofi_env::LatestWinsFeed`] nothing is replaced or dropped, so a
/// scenario can inspect the full per-entity history.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FeedEvent>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Copy of everything published so far, in publish order.
    pub fn events(&self) -> Vec<FeedEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns everything published so far.
    pub fn take(&self) -> Vec<FeedEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Position snapshots published for one entity.
    pub fn positions_for(&self, entity_id: &EntityId) -> Vec<TrackSnapshot> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Position(s) if &s.entity_id == entity_id => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn expired(&self) -> Vec<EntityId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Expired { entity_id, .. } => Some(entity_id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SnapshotSink<FeedEvent> for RecordingSink {
    fn publish(&self, _key: &str, item: FeedEvent) -> Result<(), EnvError> {
        if self.is_closed() {
            return Err(EnvError::FeedClosed);
        }
        self.events.lock().push(item);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_history() {
        let sink = RecordingSink::new();
        let id = EntityId::from("e");
        sink.publish("e", FeedEvent::Expired { entity_id: id.clone(), timestamp: 1.0 }).unwrap();
        sink.publish("e", FeedEvent::Expired { entity_id: id.clone(), timestamp: 2.0 }).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.expired(), vec![id.clone(), id]);
        assert!(sink.positions_for(&EntityId::from("e")).is_empty());
    }

    #[test]
    fn test_recording_sink_rejects_after_close() {
        let sink = RecordingSink::new();
        sink.close();
        let result = sink.publish("e", FeedEvent::Expired { entity_id: EntityId::from("e"), timestamp: 0.0 });
        assert!(matches!(result, Err(EnvError::FeedClosed)));
    }
}
