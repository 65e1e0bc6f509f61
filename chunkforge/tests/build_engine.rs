//! End-to-end build reconstruction: manifest in, verified files on disk out,
//! with the real chunk source scheduler and file constructor wired together.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use tempfile::tempdir;

use chunkforge::download::{Download, DownloadCompleteCallback, DownloadService, RequestId};
use chunkforge::filesystem::{FileSystem, OsFileSystem};
use chunkforge::serialization::{save_to_memory, sha256_hex};
use chunkforge::{
    BuildError, BuildManifest, BuildManifestBuilder, BuildObserver, ChunkId, ChunkPart,
    ChunkReferenceTracker, ChunkSource, ChunkStore, CloudChunkSource, CloudSourceConfig,
    FileConstructor, FileConstructorConfig, FileManifest, InstallMode, InstallerErrorSlot,
    NullObserver,
};

/// Download service answering from a scripted URL-to-outcome table.
/// `Some(bytes)` succeeds, `None` fails; the final outcome repeats.
struct ScriptedDownloadService {
    outcomes: Mutex<HashMap<String, VecDeque<Option<Vec<u8>>>>>,
    requests: AtomicUsize,
    next_id: AtomicU64,
}

impl ScriptedDownloadService {
    fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    fn push_outcome(&self, url: &str, outcome: Option<Vec<u8>>) {
        self.outcomes
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    fn serve_chunk(&self, config: &CloudSourceConfig, chunk_id: ChunkId, data: &[u8]) {
        self.push_outcome(
            &config.chunk_url(chunk_id),
            Some(save_to_memory(chunk_id, data, true)),
        );
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl DownloadService for ScriptedDownloadService {
    fn request_file(&self, url: String, on_complete: DownloadCompleteCallback) -> RequestId {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut outcomes = self.outcomes.lock();
            match outcomes.get_mut(&url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(None),
                Some(queue) => queue.front().cloned().unwrap_or(None),
                None => None,
            }
        };
        let download = match outcome {
            Some(data) => Download {
                request_id,
                url,
                success: true,
                status_code: 200,
                data,
                elapsed: Duration::from_millis(1),
            },
            None => Download::failed(request_id, url, 404, Duration::from_millis(1)),
        };
        on_complete(download);
        request_id
    }

    fn cancel(&self, _request_id: RequestId) {}
}

/// Download service that accepts requests and never answers them.
struct StallingDownloadService {
    next_id: AtomicU64,
}

impl StallingDownloadService {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl DownloadService for StallingDownloadService {
    fn request_file(&self, _url: String, _on_complete: DownloadCompleteCallback) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn cancel(&self, _request_id: RequestId) {}
}

/// Real filesystem with a scripted free-space answer.
struct SpaceLimitedFileSystem {
    available: u64,
    inner: OsFileSystem,
}

impl FileSystem for SpaceLimitedFileSystem {
    fn available_disk_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.available)
    }

    fn create_symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        self.inner.create_symlink(target, link)
    }

    fn set_executable(&self, path: &Path) -> io::Result<()> {
        self.inner.set_executable(path)
    }
}

#[derive(Default)]
struct EventLog {
    chunk_failures: Mutex<Vec<(ChunkId, u32)>>,
    files_completed: Mutex<Vec<(String, bool)>>,
}

impl BuildObserver for EventLog {
    fn chunk_failed(&self, chunk_id: ChunkId, retry_num: u32) {
        self.chunk_failures.lock().push((chunk_id, retry_num));
    }

    fn file_completed(&self, filename: &str, success: bool) {
        self.files_completed.lock().push((filename.to_string(), success));
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

fn fast_config() -> CloudSourceConfig {
    CloudSourceConfig {
        cloud_root: "http://cdn.test/build".to_string(),
        retry_delay_secs: vec![0.01],
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn data_file(name: &str, parts: &[(ChunkId, &[u8])]) -> FileManifest {
    let mut contents = Vec::new();
    let chunk_parts = parts
        .iter()
        .map(|(id, data)| {
            contents.extend_from_slice(data);
            ChunkPart::new(*id, 0, data.len() as u32)
        })
        .collect();
    FileManifest {
        filename: name.to_string(),
        file_size: contents.len() as u64,
        file_hash: sha256_hex(&contents),
        chunk_parts,
        symlink_target: None,
        is_executable: false,
    }
}

struct Engine {
    manifest: Arc<BuildManifest>,
    tracker: Arc<ChunkReferenceTracker>,
    source: Arc<CloudChunkSource>,
    constructor: Arc<FileConstructor>,
    error_slot: Arc<InstallerErrorSlot>,
}

fn wire(
    manifest: BuildManifest,
    config: CloudSourceConfig,
    service: Arc<dyn DownloadService>,
    filesystem: Arc<dyn FileSystem>,
    observer: Arc<dyn BuildObserver>,
    staging: &Path,
    install: &Path,
    install_mode: InstallMode,
) -> Engine {
    let manifest = Arc::new(manifest);
    let file_list = manifest.file_list().to_vec();
    let tracker = Arc::new(ChunkReferenceTracker::new(&manifest, &file_list));
    let store = Arc::new(ChunkStore::new(config.store_capacity, Arc::clone(&tracker)));
    let error_slot = Arc::new(InstallerErrorSlot::new());

    let source = Arc::new(CloudChunkSource::new(
        config,
        Arc::clone(&manifest),
        store,
        Arc::clone(&tracker),
        service,
        Arc::clone(&error_slot),
        Arc::clone(&observer),
        manifest.referenced_chunks(),
    ));

    let constructor = Arc::new(FileConstructor::new(
        FileConstructorConfig::new(staging, install, install_mode, file_list),
        Arc::clone(&manifest),
        Arc::clone(&source) as Arc<dyn ChunkSource>,
        Arc::clone(&tracker),
        filesystem,
        Arc::clone(&error_slot),
        observer,
    ));

    Engine {
        manifest,
        tracker,
        source,
        constructor,
        error_slot,
    }
}

#[test]
fn two_file_build_produces_verified_output() {
    let shared = ChunkId::random();
    let only_a = ChunkId::random();
    let only_b = ChunkId::random();
    let d_shared = random_bytes(4096);
    let d_a = random_bytes(1024);
    let d_b = random_bytes(2048);

    let manifest = BuildManifestBuilder::new("app-1.0.0")
        .add_file(data_file("a.bin", &[(only_a, &d_a), (shared, &d_shared)]))
        .add_file(data_file("sub/b.bin", &[(shared, &d_shared), (only_b, &d_b)]))
        .set_chunk_data_size(shared, d_shared.len() as u64)
        .set_chunk_data_size(only_a, d_a.len() as u64)
        .set_chunk_data_size(only_b, d_b.len() as u64)
        .build();

    let config = fast_config();
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, shared, &d_shared);
    service.serve_chunk(&config, only_a, &d_a);
    service.serve_chunk(&config, only_b, &d_b);

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let engine = wire(
        manifest,
        config,
        service,
        Arc::new(OsFileSystem::new()),
        Arc::new(NullObserver),
        staging.path(),
        install.path(),
        InstallMode::NonDestructive,
    );

    engine.constructor.wait().unwrap();
    engine.source.abort();
    engine.source.wait();

    let a = fs::read(staging.path().join("a.bin")).unwrap();
    assert_eq!(&a[..1024], d_a.as_slice());
    assert_eq!(&a[1024..], d_shared.as_slice());

    let b = fs::read(staging.path().join("sub/b.bin")).unwrap();
    assert_eq!(&b[..4096], d_shared.as_slice());
    assert_eq!(&b[4096..], d_b.as_slice());

    // Every chunk-part reference was consumed exactly once.
    assert!(engine.tracker.is_empty());
    assert!(!engine.error_slot.has_error());
}

#[test]
fn transient_failures_are_retried_until_success() {
    let c1 = ChunkId::random();
    let c2 = ChunkId::random();
    let d1 = random_bytes(100);
    let d2 = random_bytes(200);

    let manifest = BuildManifestBuilder::new("app-1.0.0")
        .add_file(data_file("a.bin", &[(c1, &d1), (c2, &d2)]))
        .build();

    let config = fast_config();
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, c1, &d1);
    // c2 fails twice before succeeding.
    service.push_outcome(&config.chunk_url(c2), None);
    service.push_outcome(&config.chunk_url(c2), None);
    service.push_outcome(&config.chunk_url(c2), Some(save_to_memory(c2, &d2, true)));

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let events = Arc::new(EventLog::default());
    let engine = wire(
        manifest,
        config,
        Arc::clone(&service) as Arc<dyn DownloadService>,
        Arc::new(OsFileSystem::new()),
        Arc::clone(&events) as Arc<dyn BuildObserver>,
        staging.path(),
        install.path(),
        InstallMode::NonDestructive,
    );

    engine.constructor.wait().unwrap();
    engine.source.abort();
    engine.source.wait();

    let built = fs::read(staging.path().join("a.bin")).unwrap();
    assert_eq!(built.len(), 300);
    assert_eq!(&built[100..], d2.as_slice());

    let failures = events.chunk_failures.lock();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|(id, _)| *id == c2));
    assert_eq!(failures[1].1, 2);

    // One request for c1, three for c2 (two failures and the success).
    assert_eq!(service.request_count(), 4);
}

#[test]
fn exhausted_retries_fail_the_build() {
    let c1 = ChunkId::random();
    let d1 = random_bytes(64);

    let manifest = BuildManifestBuilder::new("app-1.0.0")
        .add_file(data_file("a.bin", &[(c1, &d1)]))
        .build();

    let mut config = fast_config();
    config.max_retry_count = 2;
    // Nothing scripted: every request 404s.
    let service = Arc::new(ScriptedDownloadService::new());

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let engine = wire(
        manifest,
        config,
        service,
        Arc::new(OsFileSystem::new()),
        Arc::new(NullObserver),
        staging.path(),
        install.path(),
        InstallMode::NonDestructive,
    );

    let error = engine.constructor.wait().unwrap_err();
    // The source records the root cause first; the constructor's own
    // missing-chunk error is suppressed by the error slot.
    assert!(matches!(
        error,
        BuildError::DownloadRetriesExhausted { retries: 2, .. }
    ));
    engine.source.wait();
    assert!(engine.source.is_complete());
}

#[test]
fn insufficient_disk_space_writes_nothing() {
    let c1 = ChunkId::random();
    let c2 = ChunkId::random();
    let d1 = random_bytes(100);
    let d2 = random_bytes(200);

    let manifest = BuildManifestBuilder::new("app-1.0.0")
        .add_file(data_file("a.bin", &[(c1, &d1), (c2, &d2)]))
        .build();

    let config = fast_config();
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, c1, &d1);
    service.serve_chunk(&config, c2, &d2);

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let engine = wire(
        manifest,
        config,
        service,
        Arc::new(SpaceLimitedFileSystem {
            available: 50,
            inner: OsFileSystem::new(),
        }),
        Arc::new(NullObserver),
        staging.path(),
        install.path(),
        InstallMode::NonDestructive,
    );

    let error = engine.constructor.wait().unwrap_err();
    match error {
        BuildError::OutOfDiskSpace {
            required,
            available,
        } => {
            assert_eq!(required, 300);
            assert_eq!(available, 50);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!staging.path().join("a.bin").exists());

    engine.source.abort();
    engine.source.wait();
}

#[test]
fn abort_mid_download_preserves_partial_and_stops_queue() {
    let c1 = ChunkId::random();
    let c2 = ChunkId::random();
    let d1 = random_bytes(100);
    let d2 = random_bytes(200);

    let manifest = BuildManifestBuilder::new("app-1.0.0")
        .add_file(data_file("a.bin", &[(c1, &d1), (c2, &d2)]))
        .add_file(data_file("b.bin", &[(c2, &d2)]))
        .build();

    // No download ever completes, so the constructor blocks on c1.
    let service = Arc::new(StallingDownloadService::new());

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let events = Arc::new(EventLog::default());
    let engine = wire(
        manifest,
        fast_config(),
        service,
        Arc::new(OsFileSystem::new()),
        Arc::clone(&events) as Arc<dyn BuildObserver>,
        staging.path(),
        install.path(),
        InstallMode::NonDestructive,
    );

    // Let the constructor reach its blocking wait on c1.
    thread::sleep(Duration::from_millis(50));
    assert!(!engine.constructor.is_complete());

    let aborted_at = Instant::now();
    engine.constructor.abort();
    engine.source.abort();

    assert!(engine.constructor.wait().is_err());
    assert!(aborted_at.elapsed() < Duration::from_secs(2));

    // The empty partial survives for the next resume; b.bin never started.
    assert!(staging.path().join("a.bin").exists());
    assert!(!staging.path().join("b.bin").exists());
    let completed = events.files_completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0], ("a.bin".to_string(), false));

    engine.source.wait();
}

#[test]
fn interrupted_build_resumes_and_completes() {
    let c1 = ChunkId::random();
    let c2 = ChunkId::random();
    let d1 = random_bytes(2000);
    let d2 = random_bytes(2000);

    let build = |staging: &Path, install: &Path, service: Arc<ScriptedDownloadService>| {
        let manifest = BuildManifestBuilder::new("app-1.0.0")
            .add_file(data_file("a.bin", &[(c1, &d1), (c2, &d2)]))
            .build();
        wire(
            manifest,
            fast_config(),
            service,
            Arc::new(OsFileSystem::new()),
            Arc::new(NullObserver),
            staging,
            install,
            InstallMode::NonDestructive,
        )
    };

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    let config = fast_config();

    // First run: c2 is unavailable and retries exhaust.
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, c1, &d1);
    let engine = build(staging.path(), install.path(), service);
    assert!(engine.constructor.wait().is_err());
    engine.source.abort();
    engine.source.wait();
    drop(engine);

    let partial = fs::read(staging.path().join("a.bin")).unwrap();
    assert_eq!(partial, d1);

    // Second run resumes: only the trusted prefix is kept, the rest is
    // rebuilt, and the result verifies.
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, c1, &d1);
    service.serve_chunk(&config, c2, &d2);
    let engine = build(staging.path(), install.path(), service);
    engine.constructor.wait().unwrap();
    engine.source.abort();
    engine.source.wait();

    let built = fs::read(staging.path().join("a.bin")).unwrap();
    assert_eq!(&built[..2000], d1.as_slice());
    assert_eq!(&built[2000..], d2.as_slice());
    assert!(engine.tracker.is_empty());
}

#[test]
fn destructive_install_deletes_superseded_files() {
    let c1 = ChunkId::random();
    let d1 = random_bytes(512);

    let manifest = BuildManifestBuilder::new("app-2.0.0")
        .add_file(data_file("a.bin", &[(c1, &d1)]))
        .build();

    let config = fast_config();
    let service = Arc::new(ScriptedDownloadService::new());
    service.serve_chunk(&config, c1, &d1);

    let staging = tempdir().unwrap();
    let install = tempdir().unwrap();
    fs::write(install.path().join("a.bin"), b"old version").unwrap();

    let engine = wire(
        manifest,
        config,
        service,
        Arc::new(OsFileSystem::new()),
        Arc::new(NullObserver),
        staging.path(),
        install.path(),
        InstallMode::Destructive,
    );

    engine.constructor.wait().unwrap();
    engine.source.abort();
    engine.source.wait();

    assert!(!install.path().join("a.bin").exists());
    assert_eq!(fs::read(staging.path().join("a.bin")).unwrap(), d1);
    assert_eq!(engine.manifest.build_version(), "app-2.0.0");
}
