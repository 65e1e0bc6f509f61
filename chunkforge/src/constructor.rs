//! File construction from chunk parts.
//!
//! The constructor walks the manifest's file list in order and assembles
//! each file in the staging directory by pulling chunks from a `ChunkSource`
//! and writing the declared byte ranges. It is deliberately single-threaded
//! and pull-based; all download parallelism lives behind the source.
//!
//! Construction is resumable: a marker in the staging directory records
//! which files were started and completed, and a partial file's verified
//! prefix is reused after truncating a safety margin off its tail.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::{FileConstructorConfig, InstallMode, NUM_BYTES_RESUME_IGNORE};
use crate::error::{BuildError, BuildResult, InstallerErrorSlot};
use crate::filesystem::FileSystem;
use crate::manifest::{BuildManifest, ChunkId, FileManifest};
use crate::resume::{self, ResumeData};
use crate::source::ChunkSource;
use crate::stats::BuildObserver;
use crate::tracker::ChunkReferenceTracker;

/// Interval for pause and abort re-checks while construction is held.
const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Read buffer size when re-hashing a resumed file prefix.
const REHASH_BUFFER_SIZE: usize = 64 * 1024;

/// Assembles the build's files in the staging directory.
///
/// Construction starts on its own thread immediately; callers block on
/// `wait` for the outcome.
pub struct FileConstructor {
    worker: Arc<ConstructorWorker>,
    handle: Mutex<Option<JoinHandle<BuildResult<()>>>>,
}

impl FileConstructor {
    /// Create the constructor and start building immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FileConstructorConfig,
        manifest: Arc<BuildManifest>,
        source: Arc<dyn ChunkSource>,
        tracker: Arc<ChunkReferenceTracker>,
        filesystem: Arc<dyn FileSystem>,
        error_slot: Arc<InstallerErrorSlot>,
        observer: Arc<dyn BuildObserver>,
    ) -> Self {
        let worker = Arc::new(ConstructorWorker {
            config,
            manifest,
            source,
            tracker,
            filesystem,
            error_slot,
            observer,
            abort: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        });
        let handle = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                let result = worker.run();
                worker.complete.store(true, Ordering::SeqCst);
                result
            })
        };
        Self {
            worker,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request cooperative abort. The current blocking chunk wait returns
    /// promptly and no further files are started. Partials stay on disk.
    pub fn abort(&self) {
        self.worker.abort.store(true, Ordering::SeqCst);
    }

    /// Pause or resume construction between writes. Abort overrides pause.
    pub fn set_paused(&self, paused: bool) {
        self.worker.paused.store(paused, Ordering::SeqCst);
    }

    /// Whether the construction thread has finished.
    pub fn is_complete(&self) -> bool {
        self.worker.complete.load(Ordering::SeqCst)
    }

    /// Block until construction finishes and return its outcome. Later
    /// calls return `Ok(())`.
    pub fn wait(&self) -> BuildResult<()> {
        match self.handle.lock().take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(BuildError::Io(io::Error::other(
                    "file constructor thread panicked",
                )))
            }),
            None => Ok(()),
        }
    }
}

struct ConstructorWorker {
    config: FileConstructorConfig,
    manifest: Arc<BuildManifest>,
    source: Arc<dyn ChunkSource>,
    tracker: Arc<ChunkReferenceTracker>,
    filesystem: Arc<dyn FileSystem>,
    error_slot: Arc<InstallerErrorSlot>,
    observer: Arc<dyn BuildObserver>,
    abort: AtomicBool,
    paused: AtomicBool,
    complete: AtomicBool,
}

impl ConstructorWorker {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.error_slot.has_error()
    }

    fn hold_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.aborted() {
            thread::sleep(PAUSE_POLL);
        }
    }

    /// The whole construction pass: runs until every file is built and
    /// verified, or until the first fatal error or abort.
    fn run(&self) -> BuildResult<()> {
        fs::create_dir_all(&self.config.staging_dir)?;
        let mut resume_data = self.load_resume_data()?;

        if let Err(error) = self.construct_all(&mut resume_data) {
            self.error_slot.set(error);
        }

        // The slot is only read here, never drained: the installer error
        // collaborator keeps reporting the failure after the thread exits.
        match self.error_slot.error() {
            Some(error) => Err(error),
            None if self.abort.load(Ordering::SeqCst) => {
                tracing::info!("construction aborted");
                Err(BuildError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "build aborted",
                )))
            }
            None => {
                tracing::info!(
                    files = self.config.file_list.len(),
                    "construction completed"
                );
                Ok(())
            }
        }
    }

    /// Load resume data for this build version, wiping stale staging state
    /// left behind by a different version.
    fn load_resume_data(&self) -> BuildResult<ResumeData> {
        let version = self.manifest.build_version();
        match ResumeData::load(&self.config.staging_dir) {
            Some(existing) if existing.is_compatible_with(version) => {
                if existing.has_progress() {
                    tracing::info!(version, "resuming previous construction");
                    self.observer.resume_started();
                }
                Ok(existing)
            }
            Some(existing) => {
                tracing::warn!(
                    found = existing.version(),
                    expected = version,
                    "staging directory belongs to a different build; wiping"
                );
                resume::wipe_staging_dir(&self.config.staging_dir)?;
                let fresh = ResumeData::new(&self.config.staging_dir, version);
                self.persist(&fresh)?;
                Ok(fresh)
            }
            None => {
                let fresh = ResumeData::new(&self.config.staging_dir, version);
                self.persist(&fresh)?;
                Ok(fresh)
            }
        }
    }

    fn persist(&self, resume_data: &ResumeData) -> BuildResult<()> {
        resume_data
            .save()
            .map_err(|source| BuildError::ResumeDataWrite {
                path: resume_data.path().to_path_buf(),
                source,
            })
    }

    fn construct_all(&self, resume_data: &mut ResumeData) -> BuildResult<()> {
        let resuming = resume_data.has_progress();

        // Work through the list as a stack so in-progress state is a simple
        // "remaining files" set.
        let mut pending: Vec<String> = self.config.file_list.iter().rev().cloned().collect();
        let mut checked_disk_space = false;

        while let Some(filename) = pending.pop() {
            if self.aborted() {
                tracing::debug!(filename = %filename, "skipping remaining files after abort");
                return Ok(());
            }
            self.hold_while_paused();
            if self.aborted() {
                return Ok(());
            }

            let file_manifest = self
                .manifest
                .file_manifest(&filename)
                .ok_or_else(|| BuildError::MissingFileManifest {
                    filename: filename.clone(),
                })?;

            if self.can_skip_completed(resume_data, file_manifest) {
                tracing::debug!(filename = %filename, "file already constructed; skipping");
                self.pop_all_references(file_manifest)?;
                self.observer.file_completed(&filename, true);
                continue;
            }

            // Checked once per run, against the first file actually built.
            if !checked_disk_space {
                let mut remaining = vec![filename.clone()];
                remaining.extend(pending.iter().rev().cloned());
                self.check_disk_space(resume_data, &remaining)?;
                checked_disk_space = true;
            }

            // Same gate as the skip path: an old partial is only trusted
            // while the chunk cache state is still known to be clean.
            let resume_existing =
                !self.source.download_started() && resume_data.was_started(&filename);

            self.observer.file_started(&filename);
            resume_data
                .record_started(&filename)
                .map_err(|source| BuildError::ResumeDataWrite {
                    path: resume_data.path().to_path_buf(),
                    source,
                })?;

            match self.construct_file(file_manifest, resume_existing) {
                Ok(()) => {
                    resume_data
                        .record_completed(&filename)
                        .map_err(|source| BuildError::ResumeDataWrite {
                            path: resume_data.path().to_path_buf(),
                            source,
                        })?;
                    self.finish_destructive_install(&filename)?;
                    self.observer.file_completed(&filename, true);
                    tracing::info!(filename = %filename, "file constructed and verified");
                }
                Err(error) => {
                    self.observer.file_completed(&filename, false);
                    self.discard_partial_if_corrupt(&filename, &error);
                    return Err(error);
                }
            }
        }

        if resuming {
            self.observer.resume_completed();
        }
        Ok(())
    }

    /// A previously-completed file may be skipped only while its staged copy
    /// still has the exact expected size and no download has been issued yet
    /// this run. Once data starts flowing the cheap check is no longer
    /// trustworthy and everything goes through full construction.
    fn can_skip_completed(&self, resume_data: &ResumeData, file: &FileManifest) -> bool {
        if self.source.download_started() || !resume_data.was_completed(&file.filename) {
            return false;
        }
        if file.symlink_target.is_some() {
            let path = self.staging_path(&file.filename);
            return fs::symlink_metadata(&path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
        }
        let path = self.staging_path(&file.filename);
        fs::metadata(&path)
            .map(|m| m.is_file() && m.len() == file.file_size)
            .unwrap_or(false)
    }

    /// Consume every reference a skipped file would have consumed, keeping
    /// the tracker aligned with the store's eviction decisions.
    fn pop_all_references(&self, file: &FileManifest) -> BuildResult<()> {
        for part in &file.chunk_parts {
            if !self.tracker.pop_reference(part.chunk_id) {
                return Err(BuildError::TrackerUnderflow {
                    chunk_id: part.chunk_id,
                });
            }
        }
        Ok(())
    }

    /// One-time free-space check over the remaining work.
    ///
    /// Non-destructive installs need the sum of all remaining file sizes in
    /// staging. Destructive installs reclaim each superseded installed file
    /// as they go, so what matters is the peak of the running delta.
    fn check_disk_space(&self, resume_data: &ResumeData, remaining: &[String]) -> BuildResult<()> {
        let required = match self.config.install_mode {
            InstallMode::NonDestructive => remaining
                .iter()
                .map(|f| self.manifest.file_size(f).unwrap_or(0))
                .sum(),
            InstallMode::Destructive => {
                let mut current: i64 = 0;
                let mut peak: i64 = 0;
                for filename in remaining {
                    current += self.manifest.file_size(filename).unwrap_or(0) as i64;
                    peak = peak.max(current);
                    let installed = self.config.install_dir.join(filename);
                    if let Ok(metadata) = fs::metadata(&installed) {
                        current -= metadata.len() as i64;
                    }
                }
                peak.max(0) as u64
            }
        };

        // Bytes already staged count toward the requirement being met.
        let staged: u64 = remaining
            .iter()
            .filter(|f| resume_data.was_started(f))
            .filter_map(|f| fs::metadata(self.staging_path(f)).ok())
            .map(|m| m.len())
            .sum();
        let required = required.saturating_sub(staged);

        let available = self
            .filesystem
            .available_disk_space(&self.config.staging_dir)?;
        tracing::debug!(required, available, "disk space check");
        if required > available {
            return Err(BuildError::OutOfDiskSpace {
                required,
                available,
            });
        }
        Ok(())
    }

    fn staging_path(&self, filename: &str) -> PathBuf {
        self.config.staging_dir.join(filename)
    }

    /// Build one file: replay the trusted prefix of an existing partial when
    /// `resume_existing`, then write the remaining chunk parts in order and
    /// verify the final hash.
    fn construct_file(&self, file: &FileManifest, resume_existing: bool) -> BuildResult<()> {
        let path = self.staging_path(&file.filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| BuildError::FileCreateFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if let Some(target) = &file.symlink_target {
            return self.construct_symlink(file, target, &path);
        }

        let resume_parts = if resume_existing {
            self.count_resumable_parts(file, &path)
        } else {
            0
        };
        let resumed_bytes: u64 = file.chunk_parts[..resume_parts]
            .iter()
            .map(|p| p.size as u64)
            .sum();

        let mut out = if resume_parts > 0 {
            tracing::info!(
                filename = %file.filename,
                resumed_bytes,
                "resuming partial file"
            );
            let f = OpenOptions::new().read(true).write(true).open(&path).map_err(
                |source| BuildError::FileCreateFailed {
                    path: path.clone(),
                    source,
                },
            )?;
            f.set_len(resumed_bytes)
                .map_err(|source| BuildError::FileCreateFailed {
                    path: path.clone(),
                    source,
                })?;
            f
        } else {
            File::create(&path).map_err(|source| BuildError::FileCreateFailed {
                path: path.clone(),
                source,
            })?
        };

        let mut hasher = Sha256::new();
        if resume_parts > 0 {
            self.rehash_prefix(&mut out, &path, &mut hasher)?;
        }
        out.seek(SeekFrom::End(0))
            .map_err(|source| BuildError::FileCreateFailed {
                path: path.clone(),
                source,
            })?;

        // Reference underflow is reported but does not stop the file: the
        // bytes are still written, and the build fails at the end.
        let mut underflow: Option<ChunkId> = None;
        let mut pop = |chunk_id: ChunkId| {
            if !self.tracker.pop_reference(chunk_id) && underflow.is_none() {
                tracing::error!(chunk_id = %chunk_id, "chunk reference underflow");
                underflow = Some(chunk_id);
            }
        };

        // The retained prefix already consumed these references last run.
        for part in &file.chunk_parts[..resume_parts] {
            pop(part.chunk_id);
        }

        let mut written = resumed_bytes;
        for part in &file.chunk_parts[resume_parts..] {
            self.hold_while_paused();
            if self.aborted() {
                return Err(BuildError::MissingChunkData {
                    chunk_id: part.chunk_id,
                });
            }

            let chunk = self
                .source
                .get(part.chunk_id)
                .ok_or(BuildError::MissingChunkData {
                    chunk_id: part.chunk_id,
                })?;

            let start = part.offset as usize;
            let end = start + part.size as usize;
            let slice =
                chunk
                    .data()
                    .get(start..end)
                    .ok_or(BuildError::MissingChunkData {
                        chunk_id: part.chunk_id,
                    })?;

            if let Err(source) = out.write_all(slice) {
                return Err(self.classify_write_error(
                    &path,
                    source,
                    file.file_size.saturating_sub(written),
                ));
            }
            hasher.update(slice);
            written += part.size as u64;
            pop(part.chunk_id);
        }
        drop(pop);

        if let Err(source) = out.flush() {
            return Err(self.classify_write_error(&path, source, 0));
        }
        drop(out);

        let actual_hash = format!("{:x}", hasher.finalize());
        if written != file.file_size || !actual_hash.eq_ignore_ascii_case(&file.file_hash) {
            tracing::warn!(
                filename = %file.filename,
                expected = %file.file_hash,
                actual = %actual_hash,
                written,
                "constructed file failed verification"
            );
            return Err(BuildError::FileVerifyFailed {
                filename: file.filename.clone(),
            });
        }
        if let Some(chunk_id) = underflow {
            return Err(BuildError::TrackerUnderflow { chunk_id });
        }

        if file.is_executable {
            self.filesystem
                .set_executable(&path)
                .map_err(|source| BuildError::FileCreateFailed {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn construct_symlink(
        &self,
        file: &FileManifest,
        target: &Path,
        path: &Path,
    ) -> BuildResult<()> {
        if fs::symlink_metadata(path).is_ok() {
            fs::remove_file(path).map_err(|source| BuildError::FileCreateFailed {
                path: path.to_path_buf(),
                source,
            })?;
        }
        self.filesystem.create_symlink(target, path).map_err(|source| {
            if source.kind() == io::ErrorKind::Unsupported {
                BuildError::SymlinkUnsupported {
                    filename: file.filename.clone(),
                }
            } else {
                BuildError::FileCreateFailed {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        self.pop_all_references(file)
    }

    /// Number of leading chunk parts wholly contained in the trustworthy
    /// prefix of an existing partial. The final `NUM_BYTES_RESUME_IGNORE`
    /// bytes on disk are never trusted in case the previous run died
    /// mid-write.
    fn count_resumable_parts(&self, file: &FileManifest, path: &Path) -> usize {
        let existing_size = match fs::metadata(path) {
            Ok(m) if m.is_file() => m.len(),
            _ => return 0,
        };
        let usable = existing_size.saturating_sub(NUM_BYTES_RESUME_IGNORE);

        let mut parts = 0;
        let mut covered: u64 = 0;
        for part in &file.chunk_parts {
            if covered + part.size as u64 > usable {
                break;
            }
            covered += part.size as u64;
            parts += 1;
        }
        parts
    }

    /// Feed the retained file prefix through the hasher so final
    /// verification covers resumed bytes too.
    fn rehash_prefix(&self, out: &mut File, path: &Path, hasher: &mut Sha256) -> BuildResult<()> {
        out.seek(SeekFrom::Start(0))
            .map_err(|source| BuildError::FileCreateFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let mut buffer = vec![0u8; REHASH_BUFFER_SIZE];
        loop {
            let read = out
                .read(&mut buffer)
                .map_err(|source| BuildError::FileCreateFailed {
                    path: path.to_path_buf(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(())
    }

    /// A failed write usually means the volume filled up; report that when
    /// the free-space probe agrees, otherwise surface the raw I/O error.
    fn classify_write_error(&self, path: &Path, source: io::Error, remaining: u64) -> BuildError {
        match self.filesystem.available_disk_space(&self.config.staging_dir) {
            Ok(available) if available < remaining => BuildError::OutOfDiskSpace {
                required: remaining,
                available,
            },
            _ => BuildError::FileCreateFailed {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// In destructive mode each superseded installed file is deleted as soon
    /// as its replacement is verified, reclaiming its space for later files.
    fn finish_destructive_install(&self, filename: &str) -> BuildResult<()> {
        if self.config.install_mode != InstallMode::Destructive {
            return Ok(());
        }
        let installed = self.config.install_dir.join(filename);
        if installed.exists() {
            self.observer.before_file_deleted(&installed);
            tracing::debug!(path = %installed.display(), "deleting superseded installed file");
            fs::remove_file(&installed)?;
        }
        Ok(())
    }

    /// A partial whose contents are confirmed wrong is worthless and gets
    /// deleted; a partial abandoned for external reasons (missing chunk,
    /// disk space, abort) is kept for the next resume.
    fn discard_partial_if_corrupt(&self, filename: &str, error: &BuildError) {
        let corrupt = matches!(
            error,
            BuildError::FileVerifyFailed { .. }
                | BuildError::TrackerUnderflow { .. }
                | BuildError::FileCreateFailed { .. }
        );
        if !corrupt {
            return;
        }
        let path = self.staging_path(filename);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete corrupt partial");
            }
        }
    }
}
