//! Bounded in-memory chunk store.
//!
//! The store is the only resource both worker threads touch: the scheduler
//! inserts decoded chunks, the constructor borrows them for single writes.
//! Eviction is reference-aware: a chunk is only removable once the tracker
//! says nothing will read it again. Under pressure with nothing evictable,
//! the store admits overflow rather than stalling the scheduler; the
//! prefetch window bounds how far over capacity it can grow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::manifest::ChunkId;
use crate::serialization::ChunkData;
use crate::tracker::ChunkReferenceTracker;

/// Shared cache of decoded chunks keyed by chunk id.
pub struct ChunkStore {
    capacity: usize,
    tracker: Arc<ChunkReferenceTracker>,
    chunks: Mutex<HashMap<ChunkId, Arc<ChunkData>>>,
    arrival: Condvar,
}

impl ChunkStore {
    pub fn new(capacity: usize, tracker: Arc<ChunkReferenceTracker>) -> Self {
        Self {
            capacity: capacity.max(1),
            tracker,
            chunks: Mutex::new(HashMap::new()),
            arrival: Condvar::new(),
        }
    }

    /// Place a decoded chunk in the store, evicting fully-consumed chunks
    /// first if at capacity. Wakes any blocked `wait_for` callers.
    pub fn insert(&self, chunk: ChunkData) {
        let id = chunk.chunk_id();
        let mut chunks = self.chunks.lock();
        if chunks.len() >= self.capacity && !chunks.contains_key(&id) {
            let evictable: Vec<ChunkId> = chunks
                .keys()
                .copied()
                .filter(|&c| self.tracker.remaining_references(c) == 0)
                .collect();
            for victim in evictable {
                tracing::debug!(chunk_id = %victim, "evicting consumed chunk");
                chunks.remove(&victim);
                if chunks.len() < self.capacity {
                    break;
                }
            }
            if chunks.len() >= self.capacity {
                tracing::debug!(
                    len = chunks.len(),
                    capacity = self.capacity,
                    "chunk store over capacity with no evictable chunks"
                );
            }
        }
        chunks.insert(id, Arc::new(chunk));
        self.arrival.notify_all();
    }

    /// Borrow a chunk's data if present.
    pub fn get(&self, id: ChunkId) -> Option<Arc<ChunkData>> {
        self.chunks.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.lock().contains_key(&id)
    }

    /// Remove a chunk outright (repeat-requirement bookkeeping, tests).
    pub fn remove(&self, id: ChunkId) -> bool {
        self.chunks.lock().remove(&id).is_some()
    }

    /// Block up to `timeout` for `id` to arrive. Returns immediately when
    /// already present. Callers loop on this with their own abort check.
    pub fn wait_for(&self, id: ChunkId, timeout: Duration) -> Option<Arc<ChunkData>> {
        let mut chunks = self.chunks.lock();
        if let Some(chunk) = chunks.get(&id) {
            return Some(Arc::clone(chunk));
        }
        self.arrival.wait_for(&mut chunks, timeout);
        chunks.get(&id).cloned()
    }

    /// Wake all blocked `wait_for` callers (abort propagation).
    pub fn notify_all(&self) {
        self.arrival.notify_all();
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn chunk(id: ChunkId, byte: u8) -> ChunkData {
        ChunkData::new(id, vec![byte; 8])
    }

    #[test]
    fn test_insert_and_get() {
        let id = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([id]));
        let store = ChunkStore::new(4, tracker);

        assert!(store.get(id).is_none());
        store.insert(chunk(id, 1));
        assert_eq!(store.get(id).unwrap().data(), &[1u8; 8]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_eviction_only_touches_consumed_chunks() {
        let kept = ChunkId::random();
        let consumed = ChunkId::random();
        let incoming = ChunkId::random();
        // `kept` and `incoming` still have references; `consumed` has none.
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([kept, incoming]));
        let store = ChunkStore::new(2, tracker);

        store.insert(chunk(kept, 1));
        store.insert(chunk(consumed, 2));
        store.insert(chunk(incoming, 3));

        assert!(store.contains(kept));
        assert!(!store.contains(consumed));
        assert!(store.contains(incoming));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_overflow_admitted_when_nothing_evictable() {
        let a = ChunkId::random();
        let b = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([a, b]));
        let store = ChunkStore::new(1, tracker);

        store.insert(chunk(a, 1));
        store.insert(chunk(b, 2));
        // Both referenced, so both stay.
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_wait_for_returns_immediately_when_present() {
        let id = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([id]));
        let store = ChunkStore::new(4, tracker);
        store.insert(chunk(id, 5));

        let started = Instant::now();
        let result = store.wait_for(id, Duration::from_secs(5));
        assert!(result.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_wakes_on_insert() {
        let id = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([id]));
        let store = Arc::new(ChunkStore::new(4, tracker));

        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                loop {
                    if let Some(chunk) = store.wait_for(id, Duration::from_millis(100)) {
                        return Some(chunk);
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        store.insert(chunk(id, 9));

        let received = waiter.join().unwrap();
        assert_eq!(received.unwrap().data(), &[9u8; 8]);
    }

    #[test]
    fn test_wait_for_times_out_without_data() {
        let id = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([id]));
        let store = ChunkStore::new(4, tracker);

        let result = store.wait_for(id, Duration::from_millis(20));
        assert!(result.is_none());
    }

    #[test]
    fn test_remove() {
        let id = ChunkId::random();
        let tracker = Arc::new(ChunkReferenceTracker::from_sequence([id]));
        let store = ChunkStore::new(4, tracker);
        store.insert(chunk(id, 1));

        assert!(store.remove(id));
        assert!(!store.remove(id));
        assert!(store.is_empty());
    }
}
