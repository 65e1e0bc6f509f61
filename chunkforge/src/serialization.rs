//! Chunk container encode/decode.
//!
//! Serialized chunks travel as a small header followed by the payload:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CFCK"
//! 4       1     container version
//! 5       1     flags (bit 0: deflate-compressed payload)
//! 6       16    chunk GUID
//! 22      8     decoded data size (LE)
//! 30      32    SHA-256 of the decoded data
//! 62      ..    payload
//! ```
//!
//! Decoding verifies both the declared size and the SHA, so a corrupt
//! download is detected here and never reaches the store.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::manifest::ChunkId;

const CHUNK_MAGIC: &[u8; 4] = b"CFCK";
const CONTAINER_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Total header size before the payload.
pub const CHUNK_HEADER_SIZE: usize = 62;

const OFFSET_VERSION: usize = 4;
const OFFSET_FLAGS: usize = 5;
const OFFSET_CHUNK_ID: usize = 6;
const OFFSET_DATA_SIZE: usize = 22;
const OFFSET_SHA: usize = 30;

/// Decoded, verified chunk data. Owned by the chunk store once placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    chunk_id: ChunkId,
    data: Vec<u8>,
}

impl ChunkData {
    pub fn new(chunk_id: ChunkId, data: Vec<u8>) -> Self {
        Self { chunk_id, data }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Errors raised while decoding a serialized chunk.
#[derive(Debug, Error)]
pub enum ChunkLoadError {
    #[error("serialized chunk too small: {len} bytes")]
    TooSmall { len: usize },

    #[error("bad chunk container magic")]
    BadMagic,

    #[error("unsupported chunk container version {0}")]
    UnsupportedVersion(u8),

    #[error("failed to decompress chunk payload: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("decoded chunk size {actual} does not match declared {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("chunk SHA-256 mismatch")]
    ShaMismatch,
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Serialize a chunk to container bytes.
pub fn save_to_memory(chunk_id: ChunkId, data: &[u8], compress: bool) -> Vec<u8> {
    let sha: [u8; 32] = Sha256::digest(data).into();

    let payload = if compress {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        // Writing into a Vec cannot fail.
        encoder.write_all(data).expect("deflate to memory");
        encoder.finish().expect("deflate to memory")
    } else {
        data.to_vec()
    };

    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    out.extend_from_slice(CHUNK_MAGIC);
    out.push(CONTAINER_VERSION);
    out.push(if compress { FLAG_COMPRESSED } else { 0 });
    out.extend_from_slice(chunk_id.as_uuid().as_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(&sha);
    out.extend_from_slice(&payload);
    out
}

/// Decode and verify container bytes into `ChunkData`.
pub fn load_from_memory(bytes: &[u8]) -> Result<ChunkData, ChunkLoadError> {
    if bytes.len() < CHUNK_HEADER_SIZE {
        return Err(ChunkLoadError::TooSmall { len: bytes.len() });
    }
    if &bytes[..4] != CHUNK_MAGIC {
        return Err(ChunkLoadError::BadMagic);
    }
    let version = bytes[OFFSET_VERSION];
    if version != CONTAINER_VERSION {
        return Err(ChunkLoadError::UnsupportedVersion(version));
    }

    let compressed = bytes[OFFSET_FLAGS] & FLAG_COMPRESSED != 0;

    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[OFFSET_CHUNK_ID..OFFSET_CHUNK_ID + 16]);
    let chunk_id = ChunkId::new(Uuid::from_bytes(id_bytes));

    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&bytes[OFFSET_DATA_SIZE..OFFSET_DATA_SIZE + 8]);
    let declared_size = u64::from_le_bytes(size_bytes);

    let payload = &bytes[CHUNK_HEADER_SIZE..];
    let data = if compressed {
        let mut decoder = DeflateDecoder::new(payload);
        let mut out = Vec::with_capacity(declared_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(ChunkLoadError::Decompress)?;
        out
    } else {
        payload.to_vec()
    };

    if data.len() as u64 != declared_size {
        return Err(ChunkLoadError::SizeMismatch {
            declared: declared_size,
            actual: data.len() as u64,
        });
    }

    let actual_sha: [u8; 32] = Sha256::digest(&data).into();
    if actual_sha != bytes[OFFSET_SHA..OFFSET_SHA + 32] {
        return Err(ChunkLoadError::ShaMismatch);
    }

    Ok(ChunkData::new(chunk_id, data))
}

/// Overwrite the SHA-256 field of already-serialized chunk bytes.
pub fn inject_sha(bytes: &mut [u8], sha: &[u8; 32]) -> Result<(), ChunkLoadError> {
    if bytes.len() < CHUNK_HEADER_SIZE {
        return Err(ChunkLoadError::TooSmall { len: bytes.len() });
    }
    if &bytes[..4] != CHUNK_MAGIC {
        return Err(ChunkLoadError::BadMagic);
    }
    bytes[OFFSET_SHA..OFFSET_SHA + 32].copy_from_slice(sha);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_uncompressed() {
        let id = ChunkId::random();
        let data: Vec<u8> = (0u8..=255).collect();
        let bytes = save_to_memory(id, &data, false);

        let chunk = load_from_memory(&bytes).unwrap();
        assert_eq!(chunk.chunk_id(), id);
        assert_eq!(chunk.data(), data.as_slice());
        assert_eq!(chunk.len(), 256);
    }

    #[test]
    fn test_round_trip_compressed() {
        let id = ChunkId::random();
        let data = vec![7u8; 4096];
        let bytes = save_to_memory(id, &data, true);
        assert!(bytes.len() < CHUNK_HEADER_SIZE + data.len());

        let chunk = load_from_memory(&bytes).unwrap();
        assert_eq!(chunk.data(), data.as_slice());
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let id = ChunkId::random();
        let data = vec![42u8; 128];
        let mut bytes = save_to_memory(id, &data, false);

        // Flip one payload bit.
        bytes[CHUNK_HEADER_SIZE + 10] ^= 0x01;
        assert!(matches!(
            load_from_memory(&bytes),
            Err(ChunkLoadError::ShaMismatch)
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let id = ChunkId::random();
        let mut bytes = save_to_memory(id, &[1, 2, 3], false);
        bytes[0] = b'X';
        assert!(matches!(
            load_from_memory(&bytes),
            Err(ChunkLoadError::BadMagic)
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(matches!(
            load_from_memory(&[0u8; 10]),
            Err(ChunkLoadError::TooSmall { len: 10 })
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let id = ChunkId::random();
        let mut bytes = save_to_memory(id, &[1, 2, 3], false);
        bytes[OFFSET_VERSION] = 9;
        assert!(matches!(
            load_from_memory(&bytes),
            Err(ChunkLoadError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_inject_sha_repairs_header() {
        let id = ChunkId::random();
        let data = vec![9u8; 64];
        let mut bytes = save_to_memory(id, &data, false);

        // Corrupt the stored SHA, then inject the correct one back.
        bytes[OFFSET_SHA] ^= 0xff;
        assert!(load_from_memory(&bytes).is_err());

        let sha: [u8; 32] = Sha256::digest(&data).into();
        inject_sha(&mut bytes, &sha).unwrap();
        assert!(load_from_memory(&bytes).is_ok());
    }

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of "hello world"
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
