//! Chunkforge - chunk-based build reconstruction
//!
//! This library reconstructs a target file set described by a build manifest,
//! sourcing content-addressed chunks from cloud storage. A background chunk
//! source prefetches and retries downloads while the file constructor
//! assembles, verifies, and installs each file, with resume support for
//! interrupted runs.

pub mod config;
pub mod constructor;
pub mod download;
pub mod error;
pub mod filesystem;
pub mod health;
pub mod manifest;
pub mod resume;
pub mod serialization;
pub mod source;
pub mod stats;
pub mod store;
pub mod tracker;

pub use config::{CloudSourceConfig, FileConstructorConfig, InstallMode};
pub use constructor::FileConstructor;
pub use download::{Download, DownloadService, HttpDownloadService, RequestId};
pub use error::{BuildError, BuildResult, InstallerErrorSlot};
pub use health::DownloadHealth;
pub use manifest::{BuildManifest, BuildManifestBuilder, ChunkId, ChunkPart, FileManifest};
pub use resume::ResumeData;
pub use serialization::{ChunkData, ChunkLoadError};
pub use source::{ChunkSource, CloudChunkSource};
pub use stats::{BuildObserver, NullObserver};
pub use store::ChunkStore;
pub use tracker::ChunkReferenceTracker;
