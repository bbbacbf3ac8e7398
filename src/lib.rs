//! borgvr - ray-guided out-of-core bricked volume rendering
//!
//! This crate implements the CPU-side core of a brick-based, out-of-core
//! volume renderer: an offline bricker that partitions a raw volume into a
//! multi-resolution brick hierarchy on disk (`format`, `bricker`), a family
//! of runtime data sources that can serve bricks locally, remotely, or from
//! a locally-mirrored cache of a remote dataset (`source`), and the runtime
//! paging engine that keeps a fixed-size GPU texture atlas in sync with
//! what a ray-marching shader is asking for (`runtime`).
//!
//! The GPU shader body itself (ray traversal, LOD selection) is out of
//! scope; this crate specifies and implements only the CPU <-> GPU contract
//! it depends on.

pub mod core;
pub mod format;
pub mod bricker;
pub mod source;
pub mod runtime;
