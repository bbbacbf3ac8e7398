//! Scratch storage for one pyramid level's downsampled volume.
//!
//! ยง4.1 step 3: "Persist the downsampled volume to a temporary
//! memory-mapped file; use it as input to the next level" -- this keeps
//! at most one resolution level resident at a time while bricking.

use memmap2::Mmap;
use tempfile::NamedTempFile;

use super::volume_reader::VolumeReader;
use crate::core::error::Result;

pub struct MmapVolume {
    _file: NamedTempFile,
    mmap: Mmap,
    dims: (u32, u32, u32),
    components_per_voxel: u8,
    bytes_per_component: u8,
}

impl MmapVolume {
    /// Write `data` to a fresh temp file and mmap it read-only.
    pub fn create(data: &[u8], dims: (u32, u32, u32), components_per_voxel: u8, bytes_per_component: u8) -> Result<Self> {
        use std::io::Write;

        let mut file = NamedTempFile::new()?;
        file.write_all(data)?;
        file.flush()?;
        let mmap = unsafe { Mmap::map(file.as_file())? };

        Ok(Self {
            _file: file,
            mmap,
            dims,
            components_per_voxel,
            bytes_per_component,
        })
    }

    fn voxel_offset(&self, x: u32, y: u32, z: u32) -> usize {
        let voxel_bytes = self.voxel_bytes();
        ((x as usize) + (y as usize) * self.dims.0 as usize + (z as usize) * self.dims.0 as usize * self.dims.1 as usize)
            * voxel_bytes
    }
}

impl VolumeReader for MmapVolume {
    fn dimensions(&self) -> (u32, u32, u32) {
        self.dims
    }

    fn components_per_voxel(&self) -> u8 {
        self.components_per_voxel
    }

    fn bytes_per_component(&self) -> u8 {
        self.bytes_per_component
    }

    fn read_voxel(&self, x: u32, y: u32, z: u32, out: &mut [u8]) {
        let off = self.voxel_offset(x, y, z);
        let voxel_bytes = self.voxel_bytes();
        out.copy_from_slice(&self.mmap[off..off + voxel_bytes]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_temp_file() {
        let data: Vec<u8> = (0..64u8).collect();
        let volume = MmapVolume::create(&data, (4, 4, 4), 1, 1).unwrap();

        let mut out = [0u8; 1];
        volume.read_voxel(3, 0, 0, &mut out);
        assert_eq!(out[0], 3);
        volume.read_voxel(0, 1, 0, &mut out);
        assert_eq!(out[0], 4);
        volume.read_voxel(0, 0, 1, &mut out);
        assert_eq!(out[0], 16);
    }
}
