//! BORGVR metadata block: global metadata, level metadata, and per-brick
//! metadata (ยง3, ยง4.2, ยง6.1).

use bytemuck::{Pod, Zeroable};
use uuid::Uuid;

use crate::core::error::{Error, Result};

/// File magic, written verbatim at the start of the metadata block.
pub const MAGIC: &[u8; 6] = b"BORGVR";

/// Current format version.
pub const VERSION: u64 = 2;

/// Per-brick metadata, immutable after file creation.
///
/// `#[repr(C)]` + `Pod`/`Zeroable` so the array can be uploaded to the GPU
/// or bulk-read straight off an mmap without per-field copies, the same
/// convention the teacher uses for `VoxelBrick`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BrickMeta {
    /// Byte offset of the brick payload in the file.
    pub offset: u64,
    /// Bytes of payload; equals `full_brick_bytes` unless compressed smaller.
    pub size: u64,
    /// Minimum intensity over the brick.
    pub min_value: i64,
    /// Maximum intensity over the brick.
    pub max_value: i64,
}

impl BrickMeta {
    pub const ZERO: BrickMeta = BrickMeta {
        offset: 0,
        size: 0,
        min_value: 0,
        max_value: 0,
    };
}

/// Computed (not stored verbatim) per-level layout, derived from the
/// global volume dimensions and brick size at file-open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelMeta {
    /// Volume dimensions at this level, in voxels.
    pub size: [u32; 3],
    /// Number of bricks along each axis at this level.
    pub brick_count: [u32; 3],
    /// Cumulative brick count contributed by all finer levels.
    pub prev_bricks: u32,
}

impl LevelMeta {
    /// Total bricks at this level.
    pub fn brick_total(&self) -> u32 {
        self.brick_count[0] * self.brick_count[1] * self.brick_count[2]
    }

    /// Flat brick metadata index for brick-local coordinates at this level.
    pub fn brick_index(&self, x: u32, y: u32, z: u32) -> u32 {
        self.prev_bricks + x + y * self.brick_count[0] + z * self.brick_count[0] * self.brick_count[1]
    }
}

/// Global, file-wide metadata (ยง3 "Global metadata").
#[derive(Clone, Debug, PartialEq)]
pub struct BrickFileHeader {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub components_per_voxel: u8,
    pub bytes_per_component: u8,
    pub aspect: [f32; 3],
    pub brick_size: u32,
    pub overlap: u32,
    pub min_value: i64,
    pub max_value: i64,
    pub compressed: bool,
    pub uuid: Uuid,
    pub description: String,
}

impl BrickFileHeader {
    /// `brick_size^3 * components * bytes_per_component` (ยง3 invariant).
    pub fn full_brick_bytes(&self) -> usize {
        (self.brick_size as usize).pow(3)
            * self.components_per_voxel as usize
            * self.bytes_per_component as usize
    }

    /// Number of pyramid levels: `1 + ceil(log2(max_axis_brick_count))`.
    ///
    /// Level 0's brick grid determines `max_axis_brick_count`; every
    /// subsequent level halves the previous level's volume dimensions.
    pub fn level_metas(&self) -> Vec<LevelMeta> {
        let stride = self.brick_size - 2 * self.overlap;
        let mut levels = Vec::new();
        let mut size = [self.width, self.height, self.depth];
        let mut prev_bricks = 0u32;

        loop {
            let brick_count = [
                div_ceil(size[0], stride),
                div_ceil(size[1], stride),
                div_ceil(size[2], stride),
            ];
            let level = LevelMeta {
                size,
                brick_count,
                prev_bricks,
            };
            let total = level.brick_total();
            prev_bricks += total;
            let finished = brick_count[0].max(brick_count[1]).max(brick_count[2]) <= 1;
            levels.push(level);
            if finished {
                break;
            }
            size = [
                (size[0] / 2).max(1),
                (size[1] / 2).max(1),
                (size[2] / 2).max(1),
            ];
        }

        levels
    }

    /// Total brick count across all levels.
    pub fn total_bricks(&self) -> u32 {
        self.level_metas()
            .last()
            .map(|l| l.prev_bricks + l.brick_total())
            .unwrap_or(0)
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Serialize the trailing metadata block (ยง4.2 layout) to bytes.
pub fn write_metadata_block(header: &BrickFileHeader, bricks: &[BrickMeta]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(header.width as u64).to_le_bytes());
    buf.extend_from_slice(&(header.height as u64).to_le_bytes());
    buf.extend_from_slice(&(header.depth as u64).to_le_bytes());
    buf.extend_from_slice(&(header.components_per_voxel as u64).to_le_bytes());
    buf.extend_from_slice(&(header.bytes_per_component as u64).to_le_bytes());
    for a in header.aspect {
        buf.extend_from_slice(&a.to_le_bytes());
    }
    buf.extend_from_slice(&(header.brick_size as u64).to_le_bytes());
    buf.extend_from_slice(&(header.overlap as u64).to_le_bytes());
    buf.extend_from_slice(&(header.min_value as u64).to_le_bytes());
    buf.extend_from_slice(&(header.max_value as u64).to_le_bytes());
    buf.push(if header.compressed { 1 } else { 0 });
    write_string(&mut buf, &header.uuid.to_string());
    write_string(&mut buf, &header.description);
    buf.extend_from_slice(&(bricks.len() as u64).to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // reserved

    for b in bricks {
        buf.extend_from_slice(&(b.offset as i64).to_le_bytes());
        buf.extend_from_slice(&(b.size as i64).to_le_bytes());
        buf.extend_from_slice(&b.min_value.to_le_bytes());
        buf.extend_from_slice(&b.max_value.to_le_bytes());
    }

    buf
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Parse the trailing metadata block produced by [`write_metadata_block`].
pub fn parse_metadata_block(data: &[u8]) -> Result<(BrickFileHeader, Vec<BrickMeta>)> {
    let mut cur = Cursor { data, pos: 0 };

    let magic = cur.take(6)?;
    if magic != MAGIC.as_slice() {
        return Err(Error::InvalidMagic);
    }
    let version = cur.u64()?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let width = cur.u64()? as u32;
    let height = cur.u64()? as u32;
    let depth = cur.u64()? as u32;
    let components_per_voxel = cur.u64()? as u8;
    let bytes_per_component = cur.u64()? as u8;
    let aspect = [cur.f32()?, cur.f32()?, cur.f32()?];
    let brick_size = cur.u64()? as u32;
    let overlap = cur.u64()? as u32;
    let min_value = cur.u64()? as i64;
    let max_value = cur.u64()? as i64;
    let compressed = cur.u8()? != 0;
    let uuid_str = cur.string()?;
    let uuid = Uuid::parse_str(&uuid_str).map_err(|e| Error::InvalidUuid(e.to_string()))?;
    let description = cur.string()?;
    let brick_count = cur.u64()? as usize;
    let _reserved = cur.u64()?;

    let mut bricks = Vec::with_capacity(brick_count);
    for _ in 0..brick_count {
        let offset = cur.i64()? as u64;
        let size = cur.i64()? as u64;
        let min_value = cur.i64()?;
        let max_value = cur.i64()?;
        bricks.push(BrickMeta {
            offset,
            size,
            min_value,
            max_value,
        });
    }

    let header = BrickFileHeader {
        width,
        height,
        depth,
        components_per_voxel,
        bytes_per_component,
        aspect,
        brick_size,
        overlap,
        min_value,
        max_value,
        compressed,
        uuid,
        description,
    };

    Ok((header, bricks))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Truncated(format!(
                "expected {n} bytes at offset {}, file has {}",
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Truncated(format!("invalid UTF-8 string: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BrickFileHeader {
        BrickFileHeader {
            width: 128,
            height: 128,
            depth: 128,
            components_per_voxel: 1,
            bytes_per_component: 1,
            aspect: [1.0, 1.0, 1.0],
            brick_size: 32,
            overlap: 2,
            min_value: 0,
            max_value: 255,
            compressed: false,
            uuid: Uuid::nil(),
            description: "test volume".to_string(),
        }
    }

    #[test]
    fn full_brick_bytes_matches_cube() {
        let header = sample_header();
        assert_eq!(header.full_brick_bytes(), 32 * 32 * 32);
    }

    #[test]
    fn levels_for_128_cubed_32_brick_overlap_2() {
        // ยง8 boundary scenario 1: 128^3, brick_size=32, overlap=2 => stride 28
        let header = sample_header();
        let levels = header.level_metas();
        let counts: Vec<[u32; 3]> = levels.iter().map(|l| l.brick_count).collect();
        assert_eq!(counts[0], [5, 5, 5]);
        assert_eq!(counts[1], [3, 3, 3]);
        assert_eq!(counts[2], [2, 2, 2]);
        assert_eq!(counts[3], [1, 1, 1]);
        assert_eq!(levels.len(), 4);

        let total: u32 = levels.iter().map(|l| l.brick_total()).sum();
        assert_eq!(total, 5 * 5 * 5 + 3 * 3 * 3 + 2 * 2 * 2 + 1);
        assert_eq!(header.total_bricks(), total);
    }

    #[test]
    fn metadata_block_round_trips() {
        let header = sample_header();
        let bricks = vec![
            BrickMeta {
                offset: 0,
                size: 1000,
                min_value: 10,
                max_value: 200,
            },
            BrickMeta {
                offset: 1000,
                size: 500,
                min_value: 0,
                max_value: 255,
            },
        ];

        let bytes = write_metadata_block(&header, &bricks);
        let (parsed_header, parsed_bricks) = parse_metadata_block(&bytes).unwrap();

        assert_eq!(parsed_header, header);
        assert_eq!(parsed_bricks, bricks);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = write_metadata_block(&sample_header(), &[]);
        bytes[0] = b'X';
        assert!(matches!(parse_metadata_block(&bytes), Err(Error::InvalidMagic)));
    }

    #[test]
    fn rejects_truncated_block() {
        let bytes = write_metadata_block(&sample_header(), &[]);
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(
            parse_metadata_block(truncated),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn brick_index_matches_prev_bricks_plus_linear() {
        let level = LevelMeta {
            size: [64, 64, 64],
            brick_count: [3, 3, 3],
            prev_bricks: 125,
        };
        assert_eq!(level.brick_index(0, 0, 0), 125);
        assert_eq!(level.brick_index(1, 0, 0), 126);
        assert_eq!(level.brick_index(0, 1, 0), 128);
        assert_eq!(level.brick_index(0, 0, 1), 134);
    }
}
