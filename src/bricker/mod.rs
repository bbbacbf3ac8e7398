//! The offline bricker (component C3): partitions a volume into an
//! overlapping multi-resolution brick pyramid and writes a BORGVR file.

pub mod mmap_volume;
pub mod pyramid;
pub mod volume_reader;

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::Result;
use crate::format::compression::{compress_brick, Compression};
use crate::format::header::{write_metadata_block, BrickFileHeader, BrickMeta};
use mmap_volume::MmapVolume;
use pyramid::downsample;
use volume_reader::{ExtensionStrategy, VolumeReader};

/// Parameters for a single bricking run (ยง4.1 "Input").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrickerConfig {
    pub brick_size: u32,
    pub overlap: u32,
    pub extension_strategy: ExtensionStrategyConfig,
    pub compression: bool,
    pub description: String,
}

/// `serde`-friendly mirror of [`ExtensionStrategy`] (the runtime enum has
/// no derive so that it stays a plain control-flow type elsewhere).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum ExtensionStrategyConfig {
    Zero,
    Clamp,
    Wrap,
}

impl From<ExtensionStrategyConfig> for ExtensionStrategy {
    fn from(value: ExtensionStrategyConfig) -> Self {
        match value {
            ExtensionStrategyConfig::Zero => ExtensionStrategy::Zero,
            ExtensionStrategyConfig::Clamp => ExtensionStrategy::Clamp,
            ExtensionStrategyConfig::Wrap => ExtensionStrategy::Wrap,
        }
    }
}

/// Wraps either the caller's input reader (level 0) or an owned scratch
/// volume (every subsequent level), so the bricking loop can treat both
/// uniformly as `&dyn VolumeReader`.
enum LevelSource<'a> {
    Input(&'a dyn VolumeReader),
    Scratch(MmapVolume),
}

impl<'a> VolumeReader for LevelSource<'a> {
    fn dimensions(&self) -> (u32, u32, u32) {
        match self {
            LevelSource::Input(r) => r.dimensions(),
            LevelSource::Scratch(r) => r.dimensions(),
        }
    }
    fn components_per_voxel(&self) -> u8 {
        match self {
            LevelSource::Input(r) => r.components_per_voxel(),
            LevelSource::Scratch(r) => r.components_per_voxel(),
        }
    }
    fn bytes_per_component(&self) -> u8 {
        match self {
            LevelSource::Input(r) => r.bytes_per_component(),
            LevelSource::Scratch(r) => r.bytes_per_component(),
        }
    }
    fn read_voxel(&self, x: u32, y: u32, z: u32, out: &mut [u8]) {
        match self {
            LevelSource::Input(r) => r.read_voxel(x, y, z, out),
            LevelSource::Scratch(r) => r.read_voxel(x, y, z, out),
        }
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// One brick's computed payload and metadata, before it is written.
struct BrickOutput {
    data: Vec<u8>,
    min_value: i64,
    max_value: i64,
}

fn read_component(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i64,
        2 => u16::from_le_bytes(bytes.try_into().unwrap()) as i64,
        4 => u32::from_le_bytes(bytes.try_into().unwrap()) as i64,
        n => panic!("unsupported component width: {n}"),
    }
}

/// Fill one brick_size^3 buffer and compute its (min, max) histogram bounds.
fn build_brick(
    source: &dyn VolumeReader,
    origin: (i64, i64, i64),
    brick_size: u32,
    overlap: u32,
    extension: ExtensionStrategy,
) -> BrickOutput {
    let (w, h, d) = source.dimensions();
    let voxel_bytes = source.voxel_bytes();
    let bytes_per_component = source.bytes_per_component() as usize;
    let components = source.components_per_voxel() as usize;

    let mut data = vec![0u8; (brick_size as usize).pow(3) * voxel_bytes];
    let mut voxel = vec![0u8; voxel_bytes];
    let mut min_value = i64::MAX;
    let mut max_value = i64::MIN;

    for dz in 0..brick_size {
        let z = origin.2 + dz as i64 - overlap as i64;
        let zc = extension.remap(z, d);
        for dy in 0..brick_size {
            let y = origin.1 + dy as i64 - overlap as i64;
            let yc = extension.remap(y, h);
            for dx in 0..brick_size {
                let x = origin.0 + dx as i64 - overlap as i64;
                let xc = extension.remap(x, w);

                let out_off = ((dx as usize)
                    + (dy as usize) * brick_size as usize
                    + (dz as usize) * brick_size as usize * brick_size as usize)
                    * voxel_bytes;

                match (xc, yc, zc) {
                    (Some(x), Some(y), Some(z)) => {
                        source.read_voxel(x, y, z, &mut voxel);
                        data[out_off..out_off + voxel_bytes].copy_from_slice(&voxel);
                    }
                    _ => {
                        // ExtensionStrategy::Zero (or an axis that hit it).
                        for b in &mut data[out_off..out_off + voxel_bytes] {
                            *b = 0;
                        }
                    }
                }

                for c in 0..components {
                    let v = read_component(&data[out_off + c * bytes_per_component..out_off + (c + 1) * bytes_per_component]);
                    min_value = min_value.min(v);
                    max_value = max_value.max(v);
                }
            }
        }
    }

    if min_value > max_value {
        min_value = 0;
        max_value = 0;
    }

    BrickOutput {
        data,
        min_value,
        max_value,
    }
}

/// Run the bricker: partition `reader` into a multi-resolution brick
/// pyramid and write it to `out_path` as a BORGVR file.
///
/// On any I/O error the partially-written output is removed (ยง4.1
/// "Failure semantics").
pub fn run(reader: &dyn VolumeReader, config: &BrickerConfig, out_path: impl AsRef<Path>) -> Result<()> {
    let out_path = out_path.as_ref();
    match run_inner(reader, config, out_path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(out_path);
            Err(e)
        }
    }
}

fn run_inner(reader: &dyn VolumeReader, config: &BrickerConfig, out_path: &Path) -> Result<()> {
    assert!(
        config.overlap < config.brick_size / 2,
        "overlap must be < brick_size / 2"
    );

    let extension: ExtensionStrategy = config.extension_strategy.into();
    let compression = if config.compression { Compression::Lz4 } else { Compression::None };
    let (width, height, depth) = reader.dimensions();
    let components_per_voxel = reader.components_per_voxel();
    let bytes_per_component = reader.bytes_per_component();

    let mut file = File::create(out_path)?;
    file.write_all(&0u64.to_le_bytes())?; // placeholder metadata offset
    let mut write_pos: u64 = 8;

    let mut all_bricks: Vec<BrickMeta> = Vec::new();
    let mut global_min = i64::MAX;
    let mut global_max = i64::MIN;

    let mut source = LevelSource::Input(reader);

    loop {
        let (w, h, d) = source.dimensions();
        let stride = config.brick_size - 2 * config.overlap;
        let bx = div_ceil(w, stride);
        let by = div_ceil(h, stride);
        let bz = div_ceil(d, stride);

        let mut origins = Vec::with_capacity((bx * by * bz) as usize);
        for z in 0..bz {
            for y in 0..by {
                for x in 0..bx {
                    origins.push((x as i64 * stride as i64, y as i64 * stride as i64, z as i64 * stride as i64));
                }
            }
        }

        let outputs: Vec<BrickOutput> = origins
            .par_iter()
            .map(|&origin| build_brick(&source, origin, config.brick_size, config.overlap, extension))
            .collect();

        for output in outputs {
            if components_per_voxel == 1 {
                global_min = global_min.min(output.min_value);
                global_max = global_max.max(output.max_value);
            }

            let (payload, size) = match compression {
                Compression::Lz4 => match compress_brick(&output.data) {
                    Some(compressed) => {
                        let size = compressed.len() as u64;
                        (compressed, size)
                    }
                    None => {
                        let size = output.data.len() as u64;
                        (output.data.clone(), size)
                    }
                },
                Compression::None => {
                    let size = output.data.len() as u64;
                    (output.data, size)
                }
            };

            file.write_all(&payload)?;
            all_bricks.push(BrickMeta {
                offset: write_pos,
                size,
                min_value: output.min_value,
                max_value: output.max_value,
            });
            write_pos += size;
        }

        if bx.max(by).max(bz) <= 1 {
            break;
        }

        let downsampled = downsample(&source);
        source = LevelSource::Scratch(MmapVolume::create(
            downsampled.bytes(),
            downsampled.dimensions(),
            components_per_voxel,
            bytes_per_component,
        )?);
    }

    if global_min > global_max {
        global_min = 0;
        global_max = 0;
    }

    let header = BrickFileHeader {
        width,
        height,
        depth,
        components_per_voxel,
        bytes_per_component,
        aspect: [1.0, 1.0, 1.0],
        brick_size: config.brick_size,
        overlap: config.overlap,
        min_value: global_min,
        max_value: global_max,
        compressed: config.compression,
        uuid: Uuid::new_v4(),
        description: config.description.clone(),
    };

    let metadata = write_metadata_block(&header, &all_bricks);
    let metadata_offset = write_pos;
    file.write_all(&metadata)?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&metadata_offset.to_le_bytes())?;
    file.flush()?;

    log::info!(
        "bricked {}x{}x{} volume into {} bricks ({} bytes)",
        width,
        height,
        depth,
        all_bricks.len(),
        metadata_offset + metadata.len() as u64
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reader::BrickFile;
    use volume_reader::InMemoryVolumeReader;

    fn config(brick_size: u32, overlap: u32, compression: bool) -> BrickerConfig {
        BrickerConfig {
            brick_size,
            overlap,
            extension_strategy: ExtensionStrategyConfig::Clamp,
            compression,
            description: "test volume".into(),
        }
    }

    #[test]
    fn bricks_128_cubed_into_expected_level_counts() {
        let dims = (128u32, 128u32, 128u32);
        let data = vec![7u8; dims.0 as usize * dims.1 as usize * dims.2 as usize];
        let reader = InMemoryVolumeReader::new(data, dims, 1, 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.borgvr");
        run(&reader, &config(32, 2, false), &path).unwrap();

        let file = BrickFile::open(&path).unwrap();
        let levels = file.levels();
        let counts: Vec<[u32; 3]> = levels.iter().map(|l| l.brick_count).collect();
        assert_eq!(counts[0], [5, 5, 5]);
        assert_eq!(counts[1], [3, 3, 3]);
        assert_eq!(counts[2], [2, 2, 2]);
        assert_eq!(counts[3], [1, 1, 1]);
        assert_eq!(file.brick_count(), 5 * 5 * 5 + 3 * 3 * 3 + 2 * 2 * 2 + 1);
    }

    #[test]
    fn uncompressed_no_overlap_finest_level_reproduces_input() {
        // ยง8 round-trip: compression=false, overlap=0, dims a multiple of
        // brick_size => concatenating finest-level bricks in (z,y,x) order
        // reproduces the input bit-exactly.
        let dims = (8u32, 8u32, 8u32);
        let mut data = vec![0u8; 512];
        for (i, v) in data.iter_mut().enumerate() {
            *v = (i % 256) as u8;
        }
        let reader = InMemoryVolumeReader::new(data.clone(), dims, 1, 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.borgvr");
        run(&reader, &config(4, 0, false), &path).unwrap();

        let file = BrickFile::open(&path).unwrap();
        let level0 = file.levels()[0];
        assert_eq!(level0.brick_count, [2, 2, 2]);

        let mut reconstructed = vec![0u8; data.len()];
        let mut buf = Vec::new();
        for bz in 0..2u32 {
            for by in 0..2u32 {
                for bx in 0..2u32 {
                    let id = level0.brick_index(bx, by, bz);
                    file.get_brick(id, &mut buf).unwrap();
                    for dz in 0..4u32 {
                        for dy in 0..4u32 {
                            for dx in 0..4u32 {
                                let gx = bx * 4 + dx;
                                let gy = by * 4 + dy;
                                let gz = bz * 4 + dz;
                                let src = (dx + dy * 4 + dz * 16) as usize;
                                let dst = (gx + gy * 8 + gz * 64) as usize;
                                reconstructed[dst] = buf[src];
                            }
                        }
                    }
                }
            }
        }

        assert_eq!(reconstructed, data);
    }

    #[test]
    fn compression_round_trips_through_file() {
        let dims = (16u32, 16u32, 16u32);
        let data = vec![3u8; 16 * 16 * 16];
        let reader = InMemoryVolumeReader::new(data, dims, 1, 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.borgvr");
        run(&reader, &config(8, 1, true), &path).unwrap();

        let file = BrickFile::open(&path).unwrap();
        assert!(file.metadata().compressed);

        let mut buf = Vec::new();
        for id in 0..file.brick_count() {
            file.get_brick(id, &mut buf).unwrap();
            assert_eq!(buf.len(), file.full_brick_bytes());
            assert!(buf.iter().all(|&b| b == 3));
        }
    }

    #[test]
    fn aborts_and_cleans_up_on_invalid_input() {
        // overlap >= brick_size / 2 should panic via the invariant assert,
        // which, through catch_unwind, should leave no output file behind
        // thanks to `run`'s cleanup on error. Here we instead check the
        // I/O cleanup path by pointing at an unwritable directory.
        let dims = (4u32, 4u32, 4u32);
        let data = vec![0u8; 64];
        let reader = InMemoryVolumeReader::new(data, dims, 1, 1);
        let bad_path = Path::new("/nonexistent_dir_for_test/out.borgvr");
        assert!(run(&reader, &config(4, 0, false), bad_path).is_err());
    }
}
