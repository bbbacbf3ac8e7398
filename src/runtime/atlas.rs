//! `VolumeAtlas` (component C10): owns the GPU brick atlas texture and runs
//! the per-frame paging algorithm (ยง4.5). Sizing and eviction follow the
//! same shape as the teacher's GPU resource pools: a fixed-capacity slot
//! array with LRU-ish eviction driven by a monotonic arrival counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::core::error::{Error, Result};
use crate::core::types::BrickId;
use crate::format::header::{BrickFileHeader, BrickMeta, LevelMeta};
use crate::source::DataSource;

use super::emptiness::EmptinessUpdater;
use super::page_table::{PageMeta, BI_EMPTY, BI_FLAG_COUNT, BI_MISSING, PINNED_ARRIVAL_INDEX};

/// State shared (under one lock) between `VolumeAtlas` and `EmptinessUpdater`
/// (ยง5 "storage_lock").
pub struct SharedStorage {
    pub status: Vec<u32>,
    pub page_meta: Vec<PageMeta>,
    pub brick_to_page: HashMap<BrickId, u32>,
}

/// Atlas dimensions in bricks (ยง4.5.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtlasLayout {
    pub bricks: [u32; 3],
    pub capacity: u32,
}

impl AtlasLayout {
    /// `max_bricks = min(brick_count, budget / full_brick_bytes)`, then grow
    /// a cube-rooted starting shape along its shortest axis until the grid
    /// holds at least `max_bricks` slots.
    pub fn compute(budget_bytes: u64, brick_count: u32, brick_size: u32, voxel_bytes: usize) -> Self {
        let full_brick_bytes = (brick_size as u64).pow(3) * voxel_bytes as u64;
        let max_bricks = ((budget_bytes / full_brick_bytes.max(1)) as u32)
            .min(brick_count)
            .max(1);

        let mut n = [(max_bricks as f64).cbrt().floor().max(1.0) as u32; 3];
        while n[0] * n[1] * n[2] < max_bricks {
            let shortest = (0..3).min_by_key(|&i| n[i]).unwrap();
            n[shortest] += 1;
        }

        Self {
            bricks: n,
            capacity: n[0] * n[1] * n[2],
        }
    }

    pub fn voxel_dims(&self, brick_size: u32) -> [u32; 3] {
        [
            self.bricks[0] * brick_size,
            self.bricks[1] * brick_size,
            self.bricks[2] * brick_size,
        ]
    }
}

fn texture_format(components_per_voxel: u8, bytes_per_component: u8) -> Result<wgpu::TextureFormat> {
    use wgpu::TextureFormat::*;
    Ok(match (components_per_voxel, bytes_per_component) {
        (1, 1) => R8Unorm,
        (2, 1) => Rg8Unorm,
        (4, 1) => Rgba8Unorm,
        (1, 2) => R16Unorm,
        (2, 2) => Rg16Unorm,
        (4, 2) => Rgba16Unorm,
        (1, 4) => R32Uint,
        (2, 4) => Rg32Uint,
        (4, 4) => Rgba32Uint,
        (c, b) => return Err(Error::Gpu(format!("unsupported voxel format: {c} components x {b} bytes per component"))),
    })
}

/// Per-level layout handed to the shader as part of the ยง6.3 `level_table`
/// contract: enough to turn a level-local `(x, y, z)` brick coordinate into
/// a flat `brick_metadata`/`status` index, plus this level's size relative
/// to level 0 for world-space LOD error calculations.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LevelData {
    pub bricks_x: u32,
    pub bricks_x_times_y: u32,
    pub prev_bricks: u32,
    pub fractional_layout: Vec3,
}

/// Build the ยง6.3 `level_table` from the file's level metadata: one
/// `LevelData` per pyramid level, in the same level order as
/// `BrickFileHeader::level_metas`.
pub fn build_level_table(levels: &[LevelMeta]) -> Vec<LevelData> {
    let base = levels[0].size;
    levels
        .iter()
        .map(|level| LevelData {
            bricks_x: level.brick_count[0],
            bricks_x_times_y: level.brick_count[0] * level.brick_count[1],
            prev_bricks: level.prev_bricks,
            fractional_layout: Vec3::new(
                level.size[0] as f32 / base[0] as f32,
                level.size[1] as f32 / base[1] as f32,
                level.size[2] as f32 / base[2] as f32,
            ),
        })
        .collect()
}

/// For every brick, its (up to) 8 finer-level children, precomputed once at
/// open time from the pyramid's level table (ยง9 design notes).
pub fn build_child_table(levels: &[LevelMeta]) -> Vec<[Option<BrickId>; 8]> {
    let total: u32 = levels.iter().map(|l| l.brick_total()).sum();
    let mut table = vec![[None; 8]; total as usize];

    for (level_idx, level) in levels.iter().enumerate() {
        if level_idx == 0 {
            continue; // finest level has no children
        }
        let child_level = &levels[level_idx - 1];

        for z in 0..level.brick_count[2] {
            for y in 0..level.brick_count[1] {
                for x in 0..level.brick_count[0] {
                    let id = level.brick_index(x, y, z);
                    let mut kids = [None; 8];
                    let mut k = 0;
                    for dz in 0..2u32 {
                        for dy in 0..2u32 {
                            for dx in 0..2u32 {
                                let cx = (2 * x + dx).min(child_level.brick_count[0] - 1);
                                let cy = (2 * y + dy).min(child_level.brick_count[1] - 1);
                                let cz = (2 * z + dz).min(child_level.brick_count[2] - 1);
                                kids[k] = Some(child_level.brick_index(cx, cy, cz));
                                k += 1;
                            }
                        }
                    }
                    table[id as usize] = kids;
                }
            }
        }
    }

    table
}

/// Owns the GPU atlas texture plus the CPU-side page table, and services
/// whatever miss set the caller hands `page_in` each frame.
pub struct VolumeAtlas {
    texture: wgpu::Texture,
    layout: AtlasLayout,
    brick_size: u32,
    brick_count: u32,
    voxel_bytes: usize,
    storage: Arc<Mutex<SharedStorage>>,
    page_frame: u64,
    sort_scratch: Vec<u32>,
    levels: Vec<LevelMeta>,
}

impl VolumeAtlas {
    /// ยง4.5.2: allocate the texture and page table, then synchronously fetch
    /// and pin the coarsest brick at page 0.
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        header: &BrickFileHeader,
        data_source: &dyn DataSource,
        budget_bytes: u64,
    ) -> Result<(Self, Arc<Mutex<SharedStorage>>)> {
        let voxel_bytes = header.components_per_voxel as usize * header.bytes_per_component as usize;
        let brick_count = header.total_bricks();
        let layout = AtlasLayout::compute(budget_bytes, brick_count, header.brick_size, voxel_bytes);
        let dims = layout.voxel_dims(header.brick_size);
        let format = texture_format(header.components_per_voxel, header.bytes_per_component)?;

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("volume_atlas"),
            size: wgpu::Extent3d {
                width: dims[0],
                height: dims[1],
                depth_or_array_layers: dims[2],
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let storage = Arc::new(Mutex::new(SharedStorage {
            status: vec![BI_MISSING; brick_count as usize],
            page_meta: (0..layout.capacity).map(PageMeta::empty).collect(),
            brick_to_page: HashMap::new(),
        }));

        let mut atlas = Self {
            texture,
            layout,
            brick_size: header.brick_size,
            brick_count,
            voxel_bytes,
            storage: storage.clone(),
            page_frame: 0,
            sort_scratch: (0..layout.capacity).collect(),
            levels: header.level_metas(),
        };

        atlas.pin_coarsest(queue, data_source)?;
        Ok((atlas, storage))
    }

    fn pin_coarsest(&mut self, queue: &wgpu::Queue, data_source: &dyn DataSource) -> Result<()> {
        let coarsest_id = self.brick_count - 1;
        let mut buf = data_source.allocate_brick_buffer();
        data_source.first_brick(&mut buf)?;
        self.upload_subregion(queue, 0, &buf);

        let mut storage = self.storage.lock().unwrap();
        storage.page_meta[0] = PageMeta {
            page_id: 0,
            brick_id: coarsest_id as i64,
            arrival_index: PINNED_ARRIVAL_INDEX,
            previous_index: 0,
        };
        storage.brick_to_page.insert(coarsest_id, 0);
        storage.status[coarsest_id as usize] = BI_FLAG_COUNT;
        Ok(())
    }

    fn upload_subregion(&self, queue: &wgpu::Queue, page: u32, data: &[u8]) {
        let nx = self.layout.bricks[0];
        let ny = self.layout.bricks[1];
        let (ax, ay, az) = (page % nx, (page / nx) % ny, page / (nx * ny));
        let bs = self.brick_size;

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: ax * bs,
                    y: ay * bs,
                    z: az * bs,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bs * self.voxel_bytes as u32),
                rows_per_image: Some(bs),
            },
            wgpu::Extent3d {
                width: bs,
                height: bs,
                depth_or_array_layers: bs,
            },
        );
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn layout(&self) -> AtlasLayout {
        self.layout
    }

    /// ยง6.3 `level_table`: per-level layout the shader uses to resolve a
    /// brick coordinate to a flat `status`/`brick_metadata` index and to
    /// judge LOD world-space error.
    pub fn level_table(&self) -> Vec<LevelData> {
        build_level_table(&self.levels)
    }

    /// ยง4.5.3: service this frame's GPU-reported miss set against `data_source`.
    #[allow(clippy::too_many_arguments)]
    pub fn page_in(
        &mut self,
        ids: &[BrickId],
        data_source: &dyn DataSource,
        queue: &wgpu::Queue,
        brick_metas: &[BrickMeta],
        emptiness: &EmptinessUpdater,
        dataset_max_value: i64,
    ) -> Result<()> {
        data_source.new_request();

        let capacity = self.layout.capacity as usize;
        {
            let storage = self.storage.lock().unwrap();
            self.sort_scratch.sort_by_key(|&p| {
                let page = &storage.page_meta[p as usize];
                (page.arrival_index, page.previous_index)
            });
        }

        let mut insertion_index = 0usize;
        let mut overflow = false;
        let mut staging = data_source.allocate_brick_buffer();

        for &id in ids {
            if id >= self.brick_count {
                continue;
            }
            if self.storage.lock().unwrap().status[id as usize] != BI_MISSING {
                continue;
            }

            let Some(meta) = brick_metas.get(id as usize) else {
                continue;
            };
            if emptiness.current_mode_test(meta.min_value, meta.max_value, dataset_max_value) {
                self.storage.lock().unwrap().status[id as usize] = BI_EMPTY;
                continue;
            }

            {
                let mut storage = self.storage.lock().unwrap();
                if let Some(&page) = storage.brick_to_page.get(&id) {
                    if storage.page_meta[page as usize].reactivate(id) {
                        storage.status[id as usize] = BI_FLAG_COUNT + page;
                        continue;
                    }
                }
            }

            if data_source.brick(id, &mut staging).is_err() {
                // Fatal or `NotYetAvailable` -- leave BI_MISSING, retry next frame.
                continue;
            }

            // Forbid touching the pinned coarsest slot, which always sorts last.
            if insertion_index >= capacity - 1 {
                overflow = true;
                break;
            }
            let victim_page = self.sort_scratch[insertion_index];
            insertion_index += 1;

            {
                let mut storage = self.storage.lock().unwrap();
                let victim_brick_id = storage.page_meta[victim_page as usize].brick_id;
                if victim_brick_id >= 0 {
                    storage.status[victim_brick_id as usize] = BI_MISSING;
                    storage.brick_to_page.remove(&(victim_brick_id as u32));
                }
            }

            self.upload_subregion(queue, victim_page, &staging);

            let mut storage = self.storage.lock().unwrap();
            storage.page_meta[victim_page as usize] = PageMeta {
                page_id: victim_page,
                brick_id: id as i64,
                arrival_index: self.page_frame.max(1),
                previous_index: 0,
            };
            storage.brick_to_page.insert(id, victim_page);
            storage.status[id as usize] = BI_FLAG_COUNT + victim_page;
        }

        emptiness.notify_residents_changed();
        self.page_frame += 1;

        if overflow {
            return Err(Error::WorkingSetTooLarge {
                misses: ids.len(),
                capacity,
            });
        }
        Ok(())
    }

    /// ยง4.5.4: mark every slot but the pinned coarsest missing, to be
    /// re-evaluated on the next `page_in` (e.g. after a dataset switch).
    pub fn purge(&mut self) {
        let mut storage = self.storage.lock().unwrap();
        for page_id in 1..self.layout.capacity {
            let page = &mut storage.page_meta[page_id as usize];
            if page.brick_id >= 0 {
                storage.status[page.brick_id as usize] = BI_MISSING;
            }
            *page = PageMeta::empty(page_id);
        }
        storage.brick_to_page.retain(|_, &mut page| page == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atlas_layout_matches_the_worked_budget_example() {
        // 64 MiB budget, brick_size 32, single-byte voxels: 2048 max bricks,
        // cube-root-then-grow settles on 13x13x13 = 2197.
        let layout = AtlasLayout::compute(64 * 1024 * 1024, u32::MAX, 32, 1);
        assert_eq!(layout.bricks, [13, 13, 13]);
        assert_eq!(layout.capacity, 2197);
    }

    #[test]
    fn atlas_layout_never_exceeds_the_dataset_brick_count() {
        let layout = AtlasLayout::compute(u64::MAX / 2, 10, 32, 1);
        assert!(layout.capacity >= 10);
    }

    #[test]
    fn child_table_is_empty_for_the_finest_level() {
        let levels = vec![LevelMeta {
            size: [64, 64, 64],
            brick_count: [2, 2, 2],
            prev_bricks: 0,
        }];
        let table = build_child_table(&levels);
        assert_eq!(table.len(), 8);
        assert_eq!(table[0], [None; 8]);
    }

    #[test]
    fn level_table_encodes_bricks_x_and_fractional_layout() {
        let levels = vec![
            LevelMeta {
                size: [128, 128, 128],
                brick_count: [5, 5, 5],
                prev_bricks: 0,
            },
            LevelMeta {
                size: [64, 64, 64],
                brick_count: [3, 3, 3],
                prev_bricks: 125,
            },
        ];
        let table = build_level_table(&levels);
        assert_eq!(table[0].bricks_x, 5);
        assert_eq!(table[0].bricks_x_times_y, 25);
        assert_eq!(table[0].prev_bricks, 0);
        assert_eq!(table[0].fractional_layout, Vec3::ONE);

        assert_eq!(table[1].bricks_x, 3);
        assert_eq!(table[1].prev_bricks, 125);
        assert_eq!(table[1].fractional_layout, Vec3::splat(0.5));
    }
}
