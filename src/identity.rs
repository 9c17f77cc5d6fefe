//! Deterministic chunk identifiers.
//!
//! Every chunk is addressed by a 63-bit non-negative integer derived from
//! `(file_path, chunk_index)`. The high 47 bits come from a SHA-256 hash of
//! the path, the low 16 bits are the chunk's position within its file, so a
//! file's chunks form a contiguous, recomputable ID range without any global
//! counter. The top bit stays zero so the value also fits vector libraries
//! that use signed 64-bit keys.

use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Hard cap on chunks per file: the chunk index must fit 16 bits.
pub const MAX_CHUNKS_PER_FILE: usize = 1 << 16;

/// Derive the chunk ID for `(file_path, chunk_index)`.
///
/// The path hash uses the low 12 hex digits (48 bits) of the SHA-256 digest,
/// masked to 47 bits and shifted above the 16-bit chunk index.
pub fn chunk_id(file_path: &str, chunk_index: usize) -> u64 {
    debug_assert!(chunk_index < MAX_CHUNKS_PER_FILE);
    (path_prefix(file_path) << 16) | (chunk_index as u64 & 0xFFFF)
}

/// The 47-bit path prefix shared by all chunks of one file.
pub fn path_prefix(file_path: &str) -> u64 {
    let digest = Sha256::digest(file_path.as_bytes());
    // Low 12 hex digits == the last 6 bytes of the digest.
    let mut low48: u64 = 0;
    for byte in &digest[26..32] {
        low48 = (low48 << 8) | u64::from(*byte);
    }
    low48 & 0x7FFF_FFFF_FFFF
}

/// Validate that a file's chunk count fits the 16-bit index space.
pub fn check_chunk_count(file_path: &str, count: usize) -> AppResult<()> {
    if count > MAX_CHUNKS_PER_FILE {
        return Err(AppError::ChunkLimitExceeded {
            path: file_path.to_string(),
            count,
            max: MAX_CHUNKS_PER_FILE,
        });
    }
    Ok(())
}
