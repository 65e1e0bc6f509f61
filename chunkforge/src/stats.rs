//! Build observer: one-way stat/event sink from the engine to a reporter.
//!
//! The engine fires events and never queries back. Implementations must not
//! block; slow consumers should hand events off to their own channel.

use std::path::Path;

use crate::health::DownloadHealth;
use crate::manifest::ChunkId;

/// Observer for build progress events.
///
/// Every method has a no-op default so implementations subscribe only to
/// what they care about.
#[allow(unused_variables)]
pub trait BuildObserver: Send + Sync {
    /// Construction of a file has begun.
    fn file_started(&self, filename: &str) {}

    /// Construction of a file finished (verified or failed).
    fn file_completed(&self, filename: &str, success: bool) {}

    /// A chunk download was issued. `retry_num` is 0 for the first attempt.
    fn chunk_requested(&self, chunk_id: ChunkId, retry_num: u32) {}

    /// A chunk was decoded, verified, and placed in the store.
    fn chunk_stored(&self, chunk_id: ChunkId) {}

    /// A downloaded chunk failed to decode or verify.
    fn chunk_corrupt(&self, chunk_id: ChunkId) {}

    /// A chunk download failed and will be retried (or escalated).
    fn chunk_failed(&self, chunk_id: ChunkId, retry_num: u32) {}

    /// A blocked chunk request was abandoned because the build aborted.
    fn chunk_aborted(&self, chunk_id: ChunkId) {}

    /// The cumulative required download byte total changed.
    fn required_bytes_changed(&self, total: u64) {}

    /// The cumulative received byte total changed.
    fn received_bytes_changed(&self, total: u64) {}

    /// The download health tier changed.
    fn health_changed(&self, health: DownloadHealth) {}

    /// The rolling download success rate changed.
    fn success_rate_changed(&self, rate: f64) {}

    /// The number of active download requests changed.
    fn active_requests_changed(&self, count: usize) {}

    /// Usable resume data was found and replay is starting.
    fn resume_started(&self) {}

    /// Resume replay finished.
    fn resume_completed(&self) {}

    /// Fired synchronously before a superseded installed file is deleted
    /// under destructive install.
    fn before_file_deleted(&self, path: &Path) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BuildObserver for NullObserver {}
