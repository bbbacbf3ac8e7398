//! Per-brick LZ4 (de)compression (ยง4.1 step 2, ยง4.2 "Guarantees").

use crate::core::error::{Error, Result};

/// Brick payload compression scheme. Brick size is fixed per file, so this
/// is the only per-brick codec choice the format needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
}

impl Compression {
    pub fn from_flag(flag: bool) -> Self {
        if flag { Compression::Lz4 } else { Compression::None }
    }

    pub fn as_flag(self) -> bool {
        matches!(self, Compression::Lz4)
    }
}

/// Compress `raw` with LZ4. Returns `None` (keep the buffer uncompressed)
/// when the compressed form would not be smaller, per ยง4.1 step 2.
pub fn compress_brick(raw: &[u8]) -> Option<Vec<u8>> {
    let compressed = lz4_flex::block::compress(raw);
    if compressed.len() >= raw.len() {
        None
    } else {
        Some(compressed)
    }
}

/// Decompress a brick payload into exactly `full_brick_bytes` bytes.
pub fn decompress_brick(compressed: &[u8], full_brick_bytes: usize) -> Result<Vec<u8>> {
    let out = lz4_flex::block::decompress(compressed, full_brick_bytes)
        .map_err(|_| Error::DecompressionFailed)?;
    if out.len() != full_brick_bytes {
        return Err(Error::DecompressedSizeMismatch {
            expected: full_brick_bytes,
            actual: out.len(),
        });
    }
    Ok(out)
}
