//! Memory-mapped read access to a BORGVR brick file (ยง4.2).

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::compression::{decompress_brick, Compression};
use super::header::{parse_metadata_block, BrickFileHeader, BrickMeta, LevelMeta};
use crate::core::error::{Error, Result};

/// A brick file opened read-only and memory-mapped.
///
/// The only random-access breadcrumb is the 8-byte metadata offset at the
/// start of the file; everything else -- global metadata, level metadata,
/// and the flat brick metadata array -- is parsed once at open time from
/// the trailing metadata block (ยง6.1).
pub struct BrickFile {
    mmap: Mmap,
    header: BrickFileHeader,
    bricks: Vec<BrickMeta>,
    levels: Vec<LevelMeta>,
    full_brick_bytes: usize,
}

impl BrickFile {
    /// Open and mmap a brick file, parsing its metadata block.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_mmap(mmap)
    }

    fn from_mmap(mmap: Mmap) -> Result<Self> {
        if mmap.len() < 8 {
            return Err(Error::Truncated("file shorter than the 8-byte header".into()));
        }
        let metadata_offset = u64::from_le_bytes(mmap[0..8].try_into().unwrap()) as usize;
        if metadata_offset > mmap.len() {
            return Err(Error::Truncated("metadata offset points past EOF".into()));
        }
        let (header, bricks) = parse_metadata_block(&mmap[metadata_offset..])?;
        let levels = header.level_metas();
        let full_brick_bytes = header.full_brick_bytes();

        Ok(Self {
            mmap,
            header,
            bricks,
            levels,
            full_brick_bytes,
        })
    }

    pub fn metadata(&self) -> &BrickFileHeader {
        &self.header
    }

    pub fn levels(&self) -> &[LevelMeta] {
        &self.levels
    }

    pub fn brick_meta(&self, id: u32) -> Result<&BrickMeta> {
        self.bricks.get(id as usize).ok_or(Error::InvalidBrickId(id))
    }

    pub fn brick_count(&self) -> u32 {
        self.bricks.len() as u32
    }

    pub fn full_brick_bytes(&self) -> usize {
        self.full_brick_bytes
    }

    /// Copy the `size` raw (possibly compressed) bytes for brick `id` into
    /// `out`. Does not decompress.
    pub fn get_brick_raw(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        let meta = self.brick_meta(id)?;
        let start = meta.offset as usize;
        let end = start + meta.size as usize;
        if end > self.mmap.len() {
            return Err(Error::Truncated(format!(
                "brick {id} payload extends past EOF"
            )));
        }
        out.clear();
        out.extend_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    /// Read and, if necessary, LZ4-decompress brick `id` into `out`, which
    /// is resized to exactly `full_brick_bytes`.
    pub fn get_brick(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        let meta = self.brick_meta(id)?;
        let start = meta.offset as usize;
        let end = start + meta.size as usize;
        if end > self.mmap.len() {
            return Err(Error::Truncated(format!(
                "brick {id} payload extends past EOF"
            )));
        }
        let raw = &self.mmap[start..end];

        let compression = Compression::from_flag(self.header.compressed);
        if compression.as_flag() && (meta.size as usize) < self.full_brick_bytes {
            let decompressed = decompress_brick(raw, self.full_brick_bytes)?;
            *out = decompressed;
        } else {
            out.clear();
            out.extend_from_slice(raw);
            if out.len() != self.full_brick_bytes {
                return Err(Error::DecompressedSizeMismatch {
                    expected: self.full_brick_bytes,
                    actual: out.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::header::{write_metadata_block, MAGIC, VERSION};
    use std::io::Write;
    use uuid::Uuid;

    fn write_test_file(path: &Path) {
        let header = BrickFileHeader {
            width: 4,
            height: 4,
            depth: 4,
            components_per_voxel: 1,
            bytes_per_component: 1,
            aspect: [1.0, 1.0, 1.0],
            brick_size: 4,
            overlap: 0,
            min_value: 0,
            max_value: 255,
            compressed: false,
            uuid: Uuid::nil(),
            description: "unit test".into(),
        };
        let payload = vec![42u8; 64]; // 4^3 bytes
        let bricks = vec![BrickMeta {
            offset: 8,
            size: payload.len() as u64,
            min_value: 42,
            max_value: 42,
        }];
        let metadata_offset = 8 + payload.len() as u64;
        let metadata = write_metadata_block(&header, &bricks);

        let mut file = File::create(path).unwrap();
        file.write_all(&metadata_offset.to_le_bytes()).unwrap();
        file.write_all(&payload).unwrap();
        file.write_all(&metadata).unwrap();
        let _ = MAGIC;
        let _ = VERSION;
    }

    #[test]
    fn opens_and_reads_single_brick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.borgvr");
        write_test_file(&path);

        let file = BrickFile::open(&path).unwrap();
        assert_eq!(file.brick_count(), 1);
        assert_eq!(file.full_brick_bytes(), 64);

        let mut buf = Vec::new();
        file.get_brick(0, &mut buf).unwrap();
        assert_eq!(buf, vec![42u8; 64]);

        let mut raw = Vec::new();
        file.get_brick_raw(0, &mut raw).unwrap();
        assert_eq!(raw, vec![42u8; 64]);
    }

    #[test]
    fn invalid_brick_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.borgvr");
        write_test_file(&path);
        let file = BrickFile::open(&path).unwrap();

        let mut buf = Vec::new();
        assert!(matches!(
            file.get_brick(5, &mut buf),
            Err(Error::InvalidBrickId(5))
        ));
    }
}
