//! Build manifest data model and query surface.
//!
//! A build manifest describes a target file set as ordered lists of chunk
//! parts: byte ranges into content-addressed chunks. The engine only ever
//! reads the manifest; producing one is the publisher's job, for which
//! `BuildManifestBuilder` is provided.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

/// Identifier of a content-addressed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Wrap an existing GUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random chunk id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying GUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A byte range within one chunk, used as a segment of a reconstructed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPart {
    /// The chunk this part reads from.
    pub chunk_id: ChunkId,
    /// Byte offset into the decoded chunk data.
    pub offset: u32,
    /// Number of bytes this part contributes to the file.
    pub size: u32,
}

impl ChunkPart {
    pub fn new(chunk_id: ChunkId, offset: u32, size: u32) -> Self {
        Self {
            chunk_id,
            offset,
            size,
        }
    }
}

/// Per-file entry in a build manifest.
///
/// Invariant: concatenating `chunk_parts` in order yields exactly
/// `file_size` bytes whose SHA-256 hex digest equals `file_hash`.
#[derive(Debug, Clone)]
pub struct FileManifest {
    /// Path of the file relative to the install root.
    pub filename: String,
    /// Total size of the constructed file in bytes.
    pub file_size: u64,
    /// SHA-256 of the complete file contents, lowercase hex.
    pub file_hash: String,
    /// Ordered chunk parts making up the file.
    pub chunk_parts: Vec<ChunkPart>,
    /// When set, the file is a symlink to this target instead of data.
    pub symlink_target: Option<PathBuf>,
    /// Whether the unix executable bit should be set after construction.
    pub is_executable: bool,
}

impl FileManifest {
    /// Sum of the part sizes, which must equal `file_size` for a valid entry.
    pub fn parts_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| p.size as u64).sum()
    }
}

/// Read-only description of a target build: file list, chunk-part mapping,
/// expected sizes and hashes.
#[derive(Debug, Clone)]
pub struct BuildManifest {
    version: String,
    file_order: Vec<String>,
    files: HashMap<String, FileManifest>,
    chunk_data_sizes: HashMap<ChunkId, u64>,
    chunk_sha_hashes: HashMap<ChunkId, String>,
}

impl BuildManifest {
    /// Opaque version string identifying this build (app + version).
    ///
    /// Resume data is only trusted when its stored version matches this
    /// string exactly.
    pub fn build_version(&self) -> &str {
        &self.version
    }

    /// All files in manifest order.
    pub fn file_list(&self) -> &[String] {
        &self.file_order
    }

    /// Total constructed size of a file, if present.
    pub fn file_size(&self, filename: &str) -> Option<u64> {
        self.files.get(filename).map(|f| f.file_size)
    }

    /// Full per-file entry, if present.
    pub fn file_manifest(&self, filename: &str) -> Option<&FileManifest> {
        self.files.get(filename)
    }

    /// Expected serialized download size for one chunk.
    pub fn chunk_data_size(&self, chunk_id: ChunkId) -> u64 {
        self.chunk_data_sizes.get(&chunk_id).copied().unwrap_or(0)
    }

    /// Summed expected download size for a set of chunks.
    pub fn chunk_data_size_total<'a, I>(&self, chunk_ids: I) -> u64
    where
        I: IntoIterator<Item = &'a ChunkId>,
    {
        chunk_ids
            .into_iter()
            .map(|id| self.chunk_data_size(*id))
            .sum()
    }

    /// Expected SHA-256 hex digest of a chunk's decoded data, when recorded.
    pub fn chunk_sha_hash(&self, chunk_id: ChunkId) -> Option<&str> {
        self.chunk_sha_hashes.get(&chunk_id).map(|s| s.as_str())
    }

    /// Every chunk referenced by at least one file, deduplicated.
    pub fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.file_order
            .iter()
            .filter_map(|name| self.files.get(name))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.chunk_id))
            .collect()
    }
}

/// Builder for assembling a `BuildManifest` (tests, publishers).
#[derive(Debug, Default)]
pub struct BuildManifestBuilder {
    version: String,
    file_order: Vec<String>,
    files: HashMap<String, FileManifest>,
    chunk_data_sizes: HashMap<ChunkId, u64>,
    chunk_sha_hashes: HashMap<ChunkId, String>,
}

impl BuildManifestBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    /// Add a file entry. Files are listed in insertion order.
    pub fn add_file(mut self, file: FileManifest) -> Self {
        self.file_order.push(file.filename.clone());
        self.files.insert(file.filename.clone(), file);
        self
    }

    /// Record the serialized download size of a chunk.
    pub fn set_chunk_data_size(mut self, chunk_id: ChunkId, size: u64) -> Self {
        self.chunk_data_sizes.insert(chunk_id, size);
        self
    }

    /// Record the SHA-256 hex digest of a chunk's decoded data.
    pub fn set_chunk_sha_hash(mut self, chunk_id: ChunkId, sha: impl Into<String>) -> Self {
        self.chunk_sha_hashes.insert(chunk_id, sha.into());
        self
    }

    pub fn build(self) -> BuildManifest {
        BuildManifest {
            version: self.version,
            file_order: self.file_order,
            files: self.files,
            chunk_data_sizes: self.chunk_data_sizes,
            chunk_sha_hashes: self.chunk_sha_hashes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> (BuildManifest, ChunkId, ChunkId) {
        let c1 = ChunkId::random();
        let c2 = ChunkId::random();
        let manifest = BuildManifestBuilder::new("app-1.0.0")
            .add_file(FileManifest {
                filename: "a.bin".to_string(),
                file_size: 300,
                file_hash: "0".repeat(64),
                chunk_parts: vec![ChunkPart::new(c1, 0, 100), ChunkPart::new(c2, 0, 200)],
                symlink_target: None,
                is_executable: false,
            })
            .set_chunk_data_size(c1, 128)
            .set_chunk_data_size(c2, 256)
            .set_chunk_sha_hash(c1, "ab".repeat(32))
            .build();
        (manifest, c1, c2)
    }

    #[test]
    fn test_file_queries() {
        let (manifest, _, _) = sample_manifest();
        assert_eq!(manifest.build_version(), "app-1.0.0");
        assert_eq!(manifest.file_list(), &["a.bin".to_string()]);
        assert_eq!(manifest.file_size("a.bin"), Some(300));
        assert_eq!(manifest.file_size("missing.bin"), None);

        let file = manifest.file_manifest("a.bin").unwrap();
        assert_eq!(file.chunk_parts.len(), 2);
        assert_eq!(file.parts_size(), 300);
    }

    #[test]
    fn test_chunk_size_queries() {
        let (manifest, c1, c2) = sample_manifest();
        assert_eq!(manifest.chunk_data_size(c1), 128);
        assert_eq!(manifest.chunk_data_size(c2), 256);
        assert_eq!(manifest.chunk_data_size(ChunkId::random()), 0);
        assert_eq!(manifest.chunk_data_size_total([c1, c2].iter()), 384);
    }

    #[test]
    fn test_chunk_sha_lookup() {
        let (manifest, c1, c2) = sample_manifest();
        assert!(manifest.chunk_sha_hash(c1).is_some());
        assert!(manifest.chunk_sha_hash(c2).is_none());
    }

    #[test]
    fn test_referenced_chunks() {
        let (manifest, c1, c2) = sample_manifest();
        let referenced = manifest.referenced_chunks();
        assert_eq!(referenced.len(), 2);
        assert!(referenced.contains(&c1));
        assert!(referenced.contains(&c2));
    }

    #[test]
    fn test_chunk_id_display_is_stable() {
        let id = ChunkId::random();
        assert_eq!(id.to_string(), id.to_string());
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn test_file_order_preserved() {
        let c = ChunkId::random();
        let entry = |name: &str| FileManifest {
            filename: name.to_string(),
            file_size: 1,
            file_hash: String::new(),
            chunk_parts: vec![ChunkPart::new(c, 0, 1)],
            symlink_target: None,
            is_executable: false,
        };
        let manifest = BuildManifestBuilder::new("v")
            .add_file(entry("z.bin"))
            .add_file(entry("a.bin"))
            .build();
        assert_eq!(manifest.file_list(), &["z.bin".to_string(), "a.bin".to_string()]);
    }
}
