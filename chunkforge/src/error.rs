//! Error types for the build engine.

use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;

use crate::manifest::ChunkId;

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors that can occur while reconstructing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Not enough disk space to finish the remaining construction work.
    #[error("out of disk space: {required} bytes required, {available} available")]
    OutOfDiskSpace { required: u64, available: u64 },

    /// A file in the construction list has no manifest entry.
    #[error("no file manifest for {filename}")]
    MissingFileManifest { filename: String },

    /// A required chunk never became available (source aborted or exhausted).
    #[error("chunk data unavailable for {chunk_id}")]
    MissingChunkData { chunk_id: ChunkId },

    /// Constructed file bytes do not match the manifest hash.
    #[error("constructed file failed hash verification: {filename}")]
    FileVerifyFailed { filename: String },

    /// Could not create, open, or write the destination file.
    #[error("failed to write {path}: {source}")]
    FileCreateFailed { path: PathBuf, source: io::Error },

    /// A chunk download failed more times than the configured retry limit.
    #[error("download of chunk {chunk_id} failed after {retries} retries")]
    DownloadRetriesExhausted { chunk_id: ChunkId, retries: u32 },

    /// `pop_reference` returned false: the consumption sequence and the
    /// manifest's declared chunk parts disagree.
    #[error("reference tracker underflow for chunk {chunk_id}")]
    TrackerUnderflow { chunk_id: ChunkId },

    /// Symlink entries are not supported on this platform.
    #[error("symlink construction is not supported on this platform: {filename}")]
    SymlinkUnsupported { filename: String },

    /// Resume data could not be persisted.
    #[error("failed to persist resume data at {path}: {source}")]
    ResumeDataWrite { path: PathBuf, source: io::Error },

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// `io::Error` is not `Clone`; rebuild it from kind and message.
fn clone_io_error(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}

impl Clone for BuildError {
    fn clone(&self) -> Self {
        match self {
            BuildError::OutOfDiskSpace {
                required,
                available,
            } => BuildError::OutOfDiskSpace {
                required: *required,
                available: *available,
            },
            BuildError::MissingFileManifest { filename } => BuildError::MissingFileManifest {
                filename: filename.clone(),
            },
            BuildError::MissingChunkData { chunk_id } => BuildError::MissingChunkData {
                chunk_id: *chunk_id,
            },
            BuildError::FileVerifyFailed { filename } => BuildError::FileVerifyFailed {
                filename: filename.clone(),
            },
            BuildError::FileCreateFailed { path, source } => BuildError::FileCreateFailed {
                path: path.clone(),
                source: clone_io_error(source),
            },
            BuildError::DownloadRetriesExhausted { chunk_id, retries } => {
                BuildError::DownloadRetriesExhausted {
                    chunk_id: *chunk_id,
                    retries: *retries,
                }
            }
            BuildError::TrackerUnderflow { chunk_id } => BuildError::TrackerUnderflow {
                chunk_id: *chunk_id,
            },
            BuildError::SymlinkUnsupported { filename } => BuildError::SymlinkUnsupported {
                filename: filename.clone(),
            },
            BuildError::ResumeDataWrite { path, source } => BuildError::ResumeDataWrite {
                path: path.clone(),
                source: clone_io_error(source),
            },
            BuildError::Io(source) => BuildError::Io(clone_io_error(source)),
        }
    }
}

/// Shared fatal-error slot for one build operation.
///
/// Both worker threads report fatal errors here; the first writer wins and
/// later errors are logged then suppressed from user-facing reporting.
#[derive(Debug, Default)]
pub struct InstallerErrorSlot {
    inner: Mutex<Option<BuildError>>,
}

impl InstallerErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error. Returns true if this error was the first and
    /// is now the build's reported failure.
    pub fn set(&self, error: BuildError) -> bool {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            tracing::warn!(error = %error, "suppressing subsequent fatal error");
            return false;
        }
        tracing::error!(error = %error, "fatal build error");
        *slot = Some(error);
        true
    }

    /// Whether a fatal error has been recorded.
    pub fn has_error(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Human-readable message of the recorded error, if any.
    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().as_ref().map(|e| e.to_string())
    }

    /// A copy of the recorded error. The slot stays occupied so later
    /// writers are still suppressed and the orchestrator can keep querying
    /// the failure.
    pub fn error(&self) -> Option<BuildError> {
        self.inner.lock().clone()
    }
}
