//! The BORGVR on-disk bricked-volume format (component C1).
//!
//! A brick file is a header breadcrumb, an append-ordered run of brick
//! payloads, and a trailing metadata block (magic, global metadata, and
//! the flat brick metadata array). See `header` for the byte layout and
//! `reader` for the memory-mapped read path.

pub mod compression;
pub mod header;
pub mod reader;

pub use compression::Compression;
pub use header::{BrickFileHeader, BrickMeta, LevelMeta, MAGIC, VERSION};
pub use reader::BrickFile;
