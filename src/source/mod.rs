//! Runtime brick data sources (component C4): local mmap'd files, a remote
//! TCP-served dataset, and a caching layer that mirrors a remote dataset to
//! local disk while serving from whatever is already resident.

pub mod cache_map;
pub mod caching;
pub mod local;
pub mod protocol;
pub mod remote;
pub mod server;

use crate::core::error::Result;
use crate::format::header::BrickFileHeader;

/// A source of brick payloads, decompressed and ready for atlas upload.
///
/// `brick()` may be synchronous (always returns `Ok`/a fatal `Err`) or
/// asynchronous (may return `Error::NotYetAvailable` and resolve the
/// request in the background) -- `VolumeAtlas::page_in` treats both
/// uniformly by skipping the brick this frame on either outcome.
pub trait DataSource: Send + Sync {
    fn metadata(&self) -> &BrickFileHeader;

    /// Fetch the single coarsest brick (`brick_count - 1`). Must succeed
    /// synchronously for a valid file -- this is paged in once at atlas
    /// init time and the renderer has nothing to show without it.
    fn first_brick(&self, out: &mut Vec<u8>) -> Result<()> {
        let id = self.metadata().total_bricks() - 1;
        self.brick(id, out)
    }

    /// Fetch brick `id`, decompressed, into `out`. May return
    /// `Error::NotYetAvailable(id)` for a source that serves asynchronously.
    fn brick(&self, id: u32, out: &mut Vec<u8>) -> Result<()>;

    /// An owned buffer sized to hold one decompressed brick.
    fn allocate_brick_buffer(&self) -> Vec<u8> {
        vec![0u8; self.metadata().full_brick_bytes()]
    }

    /// Hint that any in-flight request queue from prior frames may be
    /// discarded. Called once per frame by `page_in`, before any `brick()`
    /// calls for that frame. No-op for sources with no internal queue.
    fn new_request(&self) {}
}
