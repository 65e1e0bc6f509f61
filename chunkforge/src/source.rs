//! Cloud chunk source: keeps the chunk store populated ahead of consumption.
//!
//! A background scheduler thread races ahead of the file constructor,
//! prefetching the chunks the reference tracker says are coming up, within a
//! bounded concurrency budget. Failed downloads retry with back-off; retry
//! exhaustion is fatal to the whole build. The constructor pulls chunks out
//! through the blocking `get`, which waits on the store until the scheduler
//! delivers or the build aborts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::CloudSourceConfig;
use crate::download::{Download, DownloadService, RequestId};
use crate::error::{BuildError, InstallerErrorSlot};
use crate::health::{DownloadHealth, MeanStdDev, SuccessRate};
use crate::manifest::{BuildManifest, ChunkId};
use crate::serialization::{self, ChunkData};
use crate::stats::BuildObserver;
use crate::store::ChunkStore;
use crate::tracker::ChunkReferenceTracker;

/// Recent download results considered for the rolling success rate.
const SUCCESS_RATE_WINDOW: usize = 64;

/// Pull interface the file constructor consumes chunks through.
pub trait ChunkSource: Send + Sync {
    /// Verified data for one chunk. Blocks until the chunk lands in the
    /// store, or returns `None` once the build aborts.
    fn get(&self, chunk_id: ChunkId) -> Option<Arc<ChunkData>>;

    /// Signal that an already-consumed chunk must be fetchable again.
    fn add_repeat_requirement(&self, chunk_id: ChunkId) -> bool;

    /// Whether any real chunk download has been issued this run.
    fn download_started(&self) -> bool;
}

/// Health tier for a success rate, boundary inclusive upward.
fn health_for_rate(config: &CloudSourceConfig, rate: f64) -> DownloadHealth {
    if rate >= config.health_excellent_rate {
        DownloadHealth::Excellent
    } else if rate >= config.health_good_rate {
        DownloadHealth::Good
    } else if rate >= config.health_ok_rate {
        DownloadHealth::Ok
    } else {
        DownloadHealth::Poor
    }
}

/// State shared between the public handle, download callbacks, and the
/// scheduler thread.
struct SourceShared {
    config: CloudSourceConfig,
    manifest: Arc<BuildManifest>,
    store: Arc<ChunkStore>,
    service: Arc<dyn DownloadService>,
    error_slot: Arc<InstallerErrorSlot>,
    observer: Arc<dyn BuildObserver>,
    abort: AtomicBool,
    paused: AtomicBool,
    complete: AtomicBool,
    download_started: AtomicBool,
    /// Chunk ids blocked `get` callers are waiting on, drained per iteration.
    priority_requests: Mutex<Vec<ChunkId>>,
    /// Finished downloads, written by transport callbacks.
    completed_downloads: Mutex<HashMap<ChunkId, Download>>,
}

/// Metadata for one in-flight download.
struct InFlightTask {
    request_id: RequestId,
    url: String,
    retry_num: u32,
    expected_size: u64,
    requested_at: Instant,
}

/// Metadata for a failed download awaiting its back-off window.
struct FailedTask {
    retry_num: u32,
    failed_at: Instant,
}

/// Chunk acquisition engine with a background scheduling loop.
pub struct CloudChunkSource {
    shared: Arc<SourceShared>,
    runtime_tx: Mutex<Sender<HashSet<ChunkId>>>,
    repeat_tx: Mutex<Sender<ChunkId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CloudChunkSource {
    /// Create the source and start its scheduler thread immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CloudSourceConfig,
        manifest: Arc<BuildManifest>,
        store: Arc<ChunkStore>,
        tracker: Arc<ChunkReferenceTracker>,
        service: Arc<dyn DownloadService>,
        error_slot: Arc<InstallerErrorSlot>,
        observer: Arc<dyn BuildObserver>,
        initial_required: HashSet<ChunkId>,
    ) -> Self {
        let shared = Arc::new(SourceShared {
            config,
            manifest,
            store,
            service,
            error_slot,
            observer,
            abort: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            download_started: AtomicBool::new(false),
            priority_requests: Mutex::new(Vec::new()),
            completed_downloads: Mutex::new(HashMap::new()),
        });
        let (runtime_tx, runtime_rx) = mpsc::channel();
        let (repeat_tx, repeat_rx) = mpsc::channel();

        let scheduler = Scheduler {
            shared: Arc::clone(&shared),
            tracker,
            runtime_rx,
            repeat_rx,
            required: initial_required,
            placed: HashSet::new(),
            in_flight: HashMap::new(),
            failed: HashMap::new(),
            priority_queue: VecDeque::new(),
            prefetch_queue: VecDeque::new(),
            success_rate: SuccessRate::new(SUCCESS_RATE_WINDOW),
            last_reported_rate: None,
            download_times: MeanStdDev::new(),
            health: None,
            required_bytes: 0,
            required_dirty: true,
            received_bytes: 0,
            trimmed: false,
            last_data_at: Instant::now(),
        };
        let handle = thread::spawn(move || scheduler.run());

        Self {
            shared,
            runtime_tx: Mutex::new(runtime_tx),
            repeat_tx: Mutex::new(repeat_tx),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Merge newly-discovered chunk requirements into the required set.
    ///
    /// Returns the subset determined to be permanently unavailable, which is
    /// always empty: availability is not pre-validated.
    pub fn add_runtime_requirements(&self, chunk_ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let _ = self.runtime_tx.lock().send(chunk_ids);
        HashSet::new()
    }

    /// Pause or resume the scheduler without tearing down state.
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    /// Request cooperative shutdown. Idempotent; all blocked `get` calls
    /// return `None` within one wait interval.
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.store.notify_all();
    }

    /// Whether the scheduler thread has exited.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }

    /// Block until the scheduler thread exits. Call `abort` first.
    pub fn wait(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ChunkSource for CloudChunkSource {
    fn get(&self, chunk_id: ChunkId) -> Option<Arc<ChunkData>> {
        loop {
            if let Some(chunk) = self.shared.store.get(chunk_id) {
                return Some(chunk);
            }
            if self.shared.abort.load(Ordering::SeqCst) {
                self.shared.observer.chunk_aborted(chunk_id);
                return None;
            }
            self.shared.priority_requests.lock().push(chunk_id);
            if let Some(chunk) = self
                .shared
                .store
                .wait_for(chunk_id, self.shared.config.poll_interval)
            {
                return Some(chunk);
            }
        }
    }

    fn add_repeat_requirement(&self, chunk_id: ChunkId) -> bool {
        self.repeat_tx.lock().send(chunk_id).is_ok()
    }

    fn download_started(&self) -> bool {
        self.shared.download_started.load(Ordering::SeqCst)
    }
}

impl Drop for CloudChunkSource {
    fn drop(&mut self) {
        self.abort();
        self.wait();
    }
}

/// Scheduler-thread state. Everything here is owned by the loop; the only
/// cross-thread traffic goes through `SourceShared` and the channels.
struct Scheduler {
    shared: Arc<SourceShared>,
    tracker: Arc<ChunkReferenceTracker>,
    runtime_rx: Receiver<HashSet<ChunkId>>,
    repeat_rx: Receiver<ChunkId>,
    required: HashSet<ChunkId>,
    /// Chunks decoded and placed in the store this run.
    placed: HashSet<ChunkId>,
    in_flight: HashMap<ChunkId, InFlightTask>,
    failed: HashMap<ChunkId, FailedTask>,
    priority_queue: VecDeque<ChunkId>,
    prefetch_queue: VecDeque<ChunkId>,
    success_rate: SuccessRate,
    last_reported_rate: Option<f64>,
    download_times: MeanStdDev,
    health: Option<DownloadHealth>,
    required_bytes: u64,
    required_dirty: bool,
    received_bytes: u64,
    trimmed: bool,
    last_data_at: Instant,
}

impl Scheduler {
    fn run(mut self) {
        tracing::debug!("chunk source scheduler started");
        while !self.aborted() {
            while self.shared.paused.load(Ordering::SeqCst) && !self.aborted() {
                thread::sleep(self.shared.config.poll_interval);
            }
            if self.aborted() {
                break;
            }

            self.drain_requirement_messages();
            self.drain_priority_requests();
            self.trim_required_once();
            self.publish_required_bytes();
            self.drain_completed_downloads();
            self.update_health();
            self.schedule_downloads();
            self.cancel_abnormally_slow();

            thread::sleep(self.shared.config.poll_interval);
        }

        for (chunk_id, task) in self.in_flight.drain() {
            tracing::debug!(chunk_id = %chunk_id, "cancelling in-flight download on shutdown");
            self.shared.service.cancel(task.request_id);
        }
        self.shared.complete.store(true, Ordering::SeqCst);
        self.shared.store.notify_all();
        tracing::debug!("chunk source scheduler stopped");
    }

    fn aborted(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst)
    }

    /// Step 1: merge runtime and repeat requirements.
    fn drain_requirement_messages(&mut self) {
        while let Ok(chunk_ids) = self.runtime_rx.try_recv() {
            for id in chunk_ids {
                if self.required.insert(id) {
                    self.required_dirty = true;
                }
            }
        }
        while let Ok(id) = self.repeat_rx.try_recv() {
            // Forget that the chunk was placed so a later `get` re-sources
            // it even after eviction.
            self.placed.remove(&id);
            if self.required.insert(id) {
                self.required_dirty = true;
            }
        }
    }

    /// Step 2: turn blocked-`get` chunk ids into priority requests.
    fn drain_priority_requests(&mut self) {
        let drained = std::mem::take(&mut *self.shared.priority_requests.lock());
        for id in drained {
            if self.is_schedulable(id) && !self.priority_queue.contains(&id) {
                if self.required.insert(id) {
                    self.required_dirty = true;
                }
                self.priority_queue.push_back(id);
            }
        }
    }

    /// Step 3: one-time trim of the required set to chunks still referenced.
    fn trim_required_once(&mut self) {
        if self.trimmed || self.required.is_empty() {
            return;
        }
        let referenced = self.tracker.referenced_chunks();
        let before = self.required.len();
        self.required.retain(|id| referenced.contains(id));
        if self.required.len() != before {
            tracing::debug!(
                dropped = before - self.required.len(),
                "trimmed unreferenced chunks from required set"
            );
            self.required_dirty = true;
        }
        self.trimmed = true;
    }

    fn publish_required_bytes(&mut self) {
        if !self.required_dirty {
            return;
        }
        self.required_dirty = false;
        let total = self.shared.manifest.chunk_data_size_total(self.required.iter());
        if total != self.required_bytes {
            self.required_bytes = total;
            self.shared.observer.required_bytes_changed(total);
        }
    }

    /// Step 4: process finished downloads — decode, verify, store or fail.
    fn drain_completed_downloads(&mut self) {
        let completed: Vec<(ChunkId, Download)> = {
            let mut lock = self.shared.completed_downloads.lock();
            lock.drain().collect()
        };

        for (chunk_id, download) in completed {
            let matches_current = self
                .in_flight
                .get(&chunk_id)
                .is_some_and(|task| task.request_id == download.request_id);
            if !matches_current {
                tracing::debug!(chunk_id = %chunk_id, "ignoring stale download result");
                continue;
            }
            let Some(current) = self.in_flight.remove(&chunk_id) else {
                continue;
            };
            self.shared
                .observer
                .active_requests_changed(self.in_flight.len());

            if !download.was_successful() {
                tracing::debug!(
                    chunk_id = %chunk_id,
                    url = %current.url,
                    status_code = download.status_code,
                    expected_size = current.expected_size,
                    "chunk download failed"
                );
                self.record_result(false);
                self.fail_task(chunk_id, current.retry_num + 1);
                continue;
            }

            match serialization::load_from_memory(&download.data) {
                Ok(chunk) if self.verify_decoded(chunk_id, &chunk) => {
                    self.download_times.push(download.elapsed.as_secs_f64());
                    self.received_bytes += download.data.len() as u64;
                    self.shared
                        .observer
                        .received_bytes_changed(self.received_bytes);
                    self.last_data_at = Instant::now();
                    self.record_result(true);
                    self.shared.store.insert(chunk);
                    self.placed.insert(chunk_id);
                    self.shared.observer.chunk_stored(chunk_id);
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        chunk_id = %chunk_id,
                        url = %current.url,
                        size = download.data.len(),
                        "downloaded chunk failed to decode or verify"
                    );
                    self.shared.observer.chunk_corrupt(chunk_id);
                    self.record_result(false);
                    self.fail_task(chunk_id, current.retry_num + 1);
                }
            }
        }
    }

    /// Container id must match the requested chunk, and when the manifest
    /// records a chunk SHA the decoded data must match it too.
    fn verify_decoded(&self, chunk_id: ChunkId, chunk: &ChunkData) -> bool {
        if chunk.chunk_id() != chunk_id {
            return false;
        }
        match self.shared.manifest.chunk_sha_hash(chunk_id) {
            Some(expected) => serialization::sha256_hex(chunk.data()) == expected,
            None => true,
        }
    }

    fn record_result(&mut self, success: bool) {
        self.success_rate.record(success);
        let rate = self.success_rate.rate();
        if self.last_reported_rate != Some(rate) {
            self.last_reported_rate = Some(rate);
            self.shared.observer.success_rate_changed(rate);
        }
    }

    fn fail_task(&mut self, chunk_id: ChunkId, retry_num: u32) {
        // Observers see every failed attempt, including the terminal one.
        self.shared.observer.chunk_failed(chunk_id, retry_num);
        if retry_num > self.shared.config.max_retry_count {
            self.shared.error_slot.set(BuildError::DownloadRetriesExhausted {
                chunk_id,
                retries: self.shared.config.max_retry_count,
            });
            self.shared.abort.store(true, Ordering::SeqCst);
            self.shared.store.notify_all();
            return;
        }
        self.failed.insert(
            chunk_id,
            FailedTask {
                retry_num,
                failed_at: Instant::now(),
            },
        );
    }

    /// Step 5: recompute the connection health tier.
    fn update_health(&mut self) {
        let outstanding = !self.in_flight.is_empty() || !self.failed.is_empty();
        let all_retrying = outstanding
            && self.in_flight.values().all(|t| t.retry_num > 0)
            && self.failed.values().all(|t| t.retry_num > 0);

        let health = if all_retrying
            && self.last_data_at.elapsed() > self.shared.config.disconnect_threshold
        {
            DownloadHealth::Disconnected
        } else {
            health_for_rate(&self.shared.config, self.success_rate.rate())
        };

        if self.health != Some(health) {
            tracing::info!(health = health.as_str(), "download health changed");
            self.health = Some(health);
            self.shared.observer.health_changed(health);
        }
    }

    /// Step 6: fill the concurrency budget in strict priority order.
    fn schedule_downloads(&mut self) {
        let max = self.shared.config.max_simultaneous_downloads;
        while self.in_flight.len() + self.failed.len() < max && !self.aborted() {
            if let Some(chunk_id) = self.next_priority_candidate() {
                self.issue_download(chunk_id, 0);
            } else if let Some((chunk_id, retry_num)) = self.next_ready_retry() {
                self.issue_download(chunk_id, retry_num);
            } else if let Some(chunk_id) = self.next_prefetch_candidate() {
                self.issue_download(chunk_id, 0);
            } else {
                break;
            }
        }
    }

    /// A chunk already placed this run is not re-sourced, even after store
    /// eviction; a repeat requirement clears it from `placed` first.
    fn is_schedulable(&self, chunk_id: ChunkId) -> bool {
        !self.in_flight.contains_key(&chunk_id)
            && !self.failed.contains_key(&chunk_id)
            && !self.placed.contains(&chunk_id)
            && !self.shared.store.contains(chunk_id)
    }

    fn next_priority_candidate(&mut self) -> Option<ChunkId> {
        while let Some(chunk_id) = self.priority_queue.pop_front() {
            if self.is_schedulable(chunk_id) {
                return Some(chunk_id);
            }
        }
        None
    }

    /// First failed chunk whose back-off window has elapsed.
    fn next_ready_retry(&mut self) -> Option<(ChunkId, u32)> {
        let ready = self.failed.iter().find_map(|(&chunk_id, task)| {
            let delay = self.shared.config.retry_delay(task.retry_num);
            (task.failed_at.elapsed() >= delay).then_some(chunk_id)
        })?;
        let task = self.failed.remove(&ready)?;
        Some((ready, task.retry_num))
    }

    fn next_prefetch_candidate(&mut self) -> Option<ChunkId> {
        let mut refilled = false;
        loop {
            if let Some(chunk_id) = self.prefetch_queue.pop_front() {
                if self.is_schedulable(chunk_id) {
                    return Some(chunk_id);
                }
                continue;
            }
            if refilled {
                return None;
            }
            self.refill_prefetch_queue();
            refilled = true;
            if self.prefetch_queue.is_empty() {
                return None;
            }
        }
    }

    fn refill_prefetch_queue(&mut self) {
        let window = self.shared.config.prefetch_window();
        let in_flight = &self.in_flight;
        let failed = &self.failed;
        let store = &self.shared.store;
        let candidates = self.tracker.select_from_next_references(window, |id| {
            !in_flight.contains_key(&id) && !failed.contains_key(&id) && !store.contains(id)
        });
        self.prefetch_queue = candidates.into();
    }

    fn issue_download(&mut self, chunk_id: ChunkId, retry_num: u32) {
        let url = self.shared.config.chunk_url(chunk_id);
        let expected_size = self.shared.manifest.chunk_data_size(chunk_id);

        let shared = Arc::clone(&self.shared);
        let request_id = self.shared.service.request_file(
            url.clone(),
            Box::new(move |download| {
                shared.completed_downloads.lock().insert(chunk_id, download);
            }),
        );

        self.shared.download_started.store(true, Ordering::SeqCst);
        self.in_flight.insert(
            chunk_id,
            InFlightTask {
                request_id,
                url,
                retry_num,
                expected_size,
                requested_at: Instant::now(),
            },
        );
        tracing::debug!(chunk_id = %chunk_id, retry_num, "issued chunk download");
        self.shared.observer.chunk_requested(chunk_id, retry_num);
        self.shared
            .observer
            .active_requests_changed(self.in_flight.len());
    }

    /// Step 7: cancel first-attempt downloads running far beyond the norm.
    /// Guards against stalled transports without a fixed timeout.
    fn cancel_abnormally_slow(&mut self) {
        if !self.download_times.is_reliable() {
            return;
        }
        let threshold = self
            .shared
            .config
            .slow_cancel_floor
            .as_secs_f64()
            .max(self.download_times.mean() + 4.0 * self.download_times.std_dev());

        let stalled: Vec<ChunkId> = self
            .in_flight
            .iter()
            .filter(|(_, task)| {
                task.retry_num == 0 && task.requested_at.elapsed().as_secs_f64() > threshold
            })
            .map(|(&chunk_id, _)| chunk_id)
            .collect();

        for chunk_id in stalled {
            let Some(task) = self.in_flight.remove(&chunk_id) else {
                continue;
            };
            tracing::warn!(
                chunk_id = %chunk_id,
                url = %task.url,
                elapsed_secs = task.requested_at.elapsed().as_secs_f64(),
                threshold_secs = threshold,
                "cancelling abnormally slow download"
            );
            self.shared.service.cancel(task.request_id);
            self.record_result(false);
            self.fail_task(chunk_id, task.retry_num + 1);
        }
    }
}
