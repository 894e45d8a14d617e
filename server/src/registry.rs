//! Latest live frame per source.
//!
//! Each source owns one slot behind its own mutex.  Slots are created on the
//! first `put_frame` and live for the rest of the process; a frame is only
//! ever replaced, never queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use bytes::Bytes;

/// One stored JPEG and when it arrived.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub received_at: SystemTime,
    /// Incremented on every write to the source.
    pub seq: u64,
}

type Slot = Arc<Mutex<Option<Frame>>>;

#[derive(Debug, Default)]
pub struct FrameRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the frame for `source` and return its sequence number.
    pub fn put_frame(&self, source: &str, data: Bytes) -> u64 {
        let slot = self.slot_or_create(source);
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = current.as_ref().map_or(1, |f| f.seq + 1);
        *current = Some(Frame {
            data,
            received_at: SystemTime::now(),
            seq,
        });
        seq
    }

    pub fn get_frame(&self, source: &str) -> Option<Frame> {
        let slot = self.slot(source)?;
        let current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        current.clone()
    }

    pub fn has_frame(&self, source: &str) -> bool {
        self.get_frame(source).is_some()
    }

    /// Sources that have received at least one frame, sorted.
    pub fn sources(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn slot(&self, source: &str) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .cloned()
    }

    fn slot_or_create(&self, source: &str) -> Slot {
        if let Some(slot) = self.slot(source) {
            return slot;
        }
        // Re-check under the write lock: another writer may have won the race.
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.entry(source.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_source() {
        let registry = FrameRegistry::new();
        assert!(registry.get_frame("m1").is_none());
        assert!(!registry.has_frame("m1"));
        assert!(registry.sources().is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let registry = FrameRegistry::new();
        assert_eq!(registry.put_frame("m1", Bytes::from_static(b"f1")), 1);
        assert_eq!(registry.put_frame("m1", Bytes::from_static(b"f2")), 2);

        let frame = registry.get_frame("m1").unwrap();
        assert_eq!(frame.data.as_ref(), b"f2");
        assert_eq!(frame.seq, 2);
        assert!(registry.get_frame("m2").is_none());
    }

    #[test]
    fn test_identical_input_identical_payload() {
        let registry = FrameRegistry::new();
        registry.put_frame("m1", Bytes::from_static(b"same"));
        let first = registry.get_frame("m1").unwrap().data;
        registry.put_frame("m1", Bytes::from_static(b"same"));
        assert_eq!(registry.get_frame("m1").unwrap().data, first);
    }

    #[test]
    fn test_sources_lists_live_only() {
        let registry = FrameRegistry::new();
        registry.put_frame("b", Bytes::from_static(b"x"));
        registry.put_frame("a", Bytes::from_static(b"y"));
        let _ = registry.get_frame("never");
        assert_eq!(registry.sources(), vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_slot() {
        let registry = Arc::new(FrameRegistry::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.slot_or_create("race")
                })
            })
            .collect();
        let slots: Vec<Slot> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for slot in &slots[1..] {
            assert!(Arc::ptr_eq(&slots[0], slot));
        }
        assert_eq!(registry.slots.read().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_writers_are_totally_ordered() {
        let registry = Arc::new(FrameRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.put_frame("m1", Bytes::from(format!("{t}-{i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.get_frame("m1").unwrap().seq, 400);
    }
}
