//! Configuration for the chunk source and file constructor.

use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::ChunkId;

// ==================== Cloud Source Defaults ====================

/// Default maximum retries for a single chunk before the build is failed.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 6;

/// Default bound on concurrent in-flight (plus retry-pending) downloads.
pub const DEFAULT_MAX_SIMULTANEOUS_DOWNLOADS: usize = 8;

/// Default per-retry back-off delays in seconds.
///
/// Indexed by `min(retry_num - 1, len - 1)`; retries past the table reuse
/// the final entry.
pub const DEFAULT_RETRY_DELAY_SECS: &[f64] = &[0.5, 1.0, 2.0, 4.0, 8.0, 16.0];

/// Default no-data window after which a fully-retrying source reports
/// `Disconnected`.
pub const DEFAULT_DISCONNECT_THRESHOLD_SECS: u64 = 5;

/// Default success-rate thresholds for the health tiers (boundary inclusive).
pub const DEFAULT_HEALTH_EXCELLENT_RATE: f64 = 0.99;
pub const DEFAULT_HEALTH_GOOD_RATE: f64 = 0.95;
pub const DEFAULT_HEALTH_OK_RATE: f64 = 0.80;

/// Default chunk store capacity in chunks.
pub const DEFAULT_STORE_CAPACITY: usize = 512;

/// Default lower/upper bounds on the prefetch window size.
pub const DEFAULT_PREFETCH_MINIMUM: usize = 32;
pub const DEFAULT_PREFETCH_MAXIMUM: usize = 1024;

/// Default floor for the abnormal-slowness cancellation threshold.
pub const DEFAULT_SLOW_CANCEL_FLOOR_SECS: u64 = 10;

/// Default scheduler iteration / blocked-wait interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Bytes discarded from the tail of a partial file before resuming, in case
/// the previous run was interrupted mid-write.
pub const NUM_BYTES_RESUME_IGNORE: u64 = 1024;

/// Configuration for `CloudChunkSource`.
#[derive(Debug, Clone)]
pub struct CloudSourceConfig {
    /// Root URL chunk paths are joined to, e.g. `https://cdn.example.com/builds/1.0`.
    pub cloud_root: String,
    /// Maximum retries for one chunk; exceeding this is a fatal build error.
    pub max_retry_count: u32,
    /// Bound on concurrent in-flight plus retry-pending downloads.
    pub max_simultaneous_downloads: usize,
    /// Per-retry back-off delay table in seconds.
    pub retry_delay_secs: Vec<f64>,
    /// No-data window before reporting `Disconnected`.
    pub disconnect_threshold: Duration,
    /// Success-rate tier thresholds, boundary inclusive upward.
    pub health_excellent_rate: f64,
    pub health_good_rate: f64,
    pub health_ok_rate: f64,
    /// Chunk store capacity in chunks; also seeds the prefetch window size.
    pub store_capacity: usize,
    /// Prefetch window clamp.
    pub prefetch_minimum: usize,
    pub prefetch_maximum: usize,
    /// Floor for the watchdog cancellation threshold.
    pub slow_cancel_floor: Duration,
    /// Scheduler iteration and blocked-wait interval.
    pub poll_interval: Duration,
}

impl Default for CloudSourceConfig {
    fn default() -> Self {
        Self {
            cloud_root: String::new(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            max_simultaneous_downloads: DEFAULT_MAX_SIMULTANEOUS_DOWNLOADS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS.to_vec(),
            disconnect_threshold: Duration::from_secs(DEFAULT_DISCONNECT_THRESHOLD_SECS),
            health_excellent_rate: DEFAULT_HEALTH_EXCELLENT_RATE,
            health_good_rate: DEFAULT_HEALTH_GOOD_RATE,
            health_ok_rate: DEFAULT_HEALTH_OK_RATE,
            store_capacity: DEFAULT_STORE_CAPACITY,
            prefetch_minimum: DEFAULT_PREFETCH_MINIMUM,
            prefetch_maximum: DEFAULT_PREFETCH_MAXIMUM,
            slow_cancel_floor: Duration::from_secs(DEFAULT_SLOW_CANCEL_FLOOR_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl CloudSourceConfig {
    pub fn new(cloud_root: impl Into<String>) -> Self {
        Self {
            cloud_root: cloud_root.into(),
            ..Default::default()
        }
    }

    /// Download URL for one chunk.
    pub fn chunk_url(&self, chunk_id: ChunkId) -> String {
        format!("{}/{}.chunk", self.cloud_root.trim_end_matches('/'), chunk_id)
    }

    /// Back-off delay before the `retry_num`-th retry of a failed chunk.
    pub fn retry_delay(&self, retry_num: u32) -> Duration {
        if self.retry_delay_secs.is_empty() || retry_num == 0 {
            return Duration::ZERO;
        }
        let index = ((retry_num - 1) as usize).min(self.retry_delay_secs.len() - 1);
        Duration::from_secs_f64(self.retry_delay_secs[index])
    }

    /// Prefetch window size: `max(store_capacity, prefetch_minimum)` clamped
    /// to `prefetch_maximum`.
    pub fn prefetch_window(&self) -> usize {
        self.store_capacity
            .max(self.prefetch_minimum)
            .min(self.prefetch_maximum)
    }
}

/// Install mode for constructed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Leave superseded installed files in place; output stays in staging.
    NonDestructive,
    /// Delete each superseded installed file as soon as its replacement is
    /// verified, trading peak disk usage for lower total disk usage.
    Destructive,
}

/// Configuration for `FileConstructor`.
#[derive(Debug, Clone)]
pub struct FileConstructorConfig {
    /// Directory files are constructed into.
    pub staging_dir: PathBuf,
    /// Directory currently-installed files live in.
    pub install_dir: PathBuf,
    /// Whether superseded installed files are deleted as construction goes.
    pub install_mode: InstallMode,
    /// Ordered list of files to construct.
    pub file_list: Vec<String>,
}

impl FileConstructorConfig {
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        install_mode: InstallMode,
        file_list: Vec<String>,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            install_dir: install_dir.into(),
            install_mode,
            file_list,
        }
    }
}
