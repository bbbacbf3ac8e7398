//! Error types for the borgvr engine

use thiserror::Error;

/// Main error type for the engine.
///
/// Variants are grouped along the lines of the design's error model:
/// fatal errors abort whatever operation produced them, while per-brick
/// errors are recoverable and degrade to "brick missing" for the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file's 6-byte magic did not read `BORGVR`.
    #[error("invalid magic bytes in brick file")]
    InvalidMagic,

    /// The file's version field is not one this build understands.
    #[error("unsupported brick file version: {0}")]
    UnsupportedVersion(u64),

    /// The metadata block's UUID string did not parse.
    #[error("invalid UUID in brick file metadata: {0}")]
    InvalidUuid(String),

    /// File truncated while reading the metadata block or a brick payload.
    #[error("brick file truncated: {0}")]
    Truncated(String),

    /// LZ4 decode failed outright.
    #[error("brick decompression failed")]
    DecompressionFailed,

    /// LZ4 decode succeeded but produced the wrong number of bytes.
    #[error("decompressed brick size mismatch: expected {expected}, got {actual}")]
    DecompressedSizeMismatch { expected: usize, actual: usize },

    /// Requested brick index is out of range for this file.
    #[error("brick index {0} out of range")]
    InvalidBrickId(u32),

    /// Async/streaming data source does not have the brick yet.
    #[error("brick {0} not yet available")]
    NotYetAvailable(u32),

    /// GPU resource allocation failed (atlas texture, pool buffer, ...).
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The frame's miss set could not be fully serviced by the atlas.
    #[error("working set too large: {misses} misses exceed capacity {capacity}")]
    WorkingSetTooLarge { misses: usize, capacity: usize },

    /// Remote protocol errors.
    #[error("protocol error: {0}")]
    InvalidResponse(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
