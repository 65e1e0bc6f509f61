//! Chunk reference tracking.
//!
//! The tracker holds the global, ordered sequence of chunk consumption
//! across the whole build: one entry per chunk part, in construction order.
//! It answers "which distinct chunks are coming up next" for the prefetch
//! window, and consumes one reference per chunk part written, which is what
//! lets the store evict chunks that will never be read again.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::manifest::{BuildManifest, ChunkId};

/// Ordered, deduplicating view over the build's future chunk consumption.
///
/// Thread-safe: shared between the file constructor (popping) and the cloud
/// chunk source (peeking for prefetch).
#[derive(Debug)]
pub struct ChunkReferenceTracker {
    references: Mutex<VecDeque<ChunkId>>,
}

impl ChunkReferenceTracker {
    /// Build the consumption sequence from a manifest and an ordered file
    /// list: every chunk part of every listed file, in order.
    pub fn new(manifest: &BuildManifest, file_list: &[String]) -> Self {
        let references = file_list
            .iter()
            .filter_map(|name| manifest.file_manifest(name))
            .flat_map(|file| file.chunk_parts.iter().map(|p| p.chunk_id))
            .collect();
        Self {
            references: Mutex::new(references),
        }
    }

    /// Create a tracker from an explicit reference sequence.
    pub fn from_sequence(sequence: impl IntoIterator<Item = ChunkId>) -> Self {
        Self {
            references: Mutex::new(sequence.into_iter().collect()),
        }
    }

    /// Up to `max_count` distinct upcoming chunk ids, in consumption order,
    /// that satisfy `predicate`. Does not mutate tracker state.
    pub fn select_from_next_references<F>(&self, max_count: usize, predicate: F) -> Vec<ChunkId>
    where
        F: Fn(ChunkId) -> bool,
    {
        let references = self.references.lock();
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for &id in references.iter() {
            if selected.len() >= max_count {
                break;
            }
            if seen.insert(id) && predicate(id) {
                selected.push(id);
            }
        }
        selected
    }

    /// Consume one occurrence of `id` from the front of the unconsumed
    /// sequence. Returns false if `id` has no remaining references, which
    /// signals an invariant violation between manifest and consumption.
    pub fn pop_reference(&self, id: ChunkId) -> bool {
        let mut references = self.references.lock();
        match references.iter().position(|&r| r == id) {
            Some(pos) => {
                references.remove(pos);
                true
            }
            None => false,
        }
    }

    /// All chunk ids with at least one remaining reference.
    pub fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.references.lock().iter().copied().collect()
    }

    /// Remaining reference count for one chunk.
    pub fn remaining_references(&self, id: ChunkId) -> usize {
        self.references.lock().iter().filter(|&&r| r == id).count()
    }

    /// Total remaining references across all chunks.
    pub fn len(&self) -> usize {
        self.references.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.lock().is_empty()
    }
}
