//! `GpuHashtable` (component C11, ยง4.7): a fixed-capacity linear-probing
//! table the fragment shader writes brick-miss reports into, read back and
//! deduplicated on the CPU once per frame to build `VolumeAtlas::page_in`'s
//! miss set.

use crate::core::types::BrickId;

/// Sentinel slot value meaning "unused" (ยง6.3: "zero = free"; ยง4.7: the CPU
/// side "extracts unique non-zero entries"). A zero-initialized GPU buffer
/// therefore starts all-free, matching the shader's own clear-to-zero.
///
/// Brick id `0` is itself a valid id, so slots store `id + 1` internally and
/// `0` is reserved exclusively for "empty" -- the boundary case ยง9 asks
/// implementers to document rather than guess at.
const EMPTY_SLOT: u32 = 0;

/// Size the table to the next power of two at or above
/// `ceil(min_MB * 2^20 / full_brick_bytes)` slots, so probing stays cheap
/// even under a nearly-full table.
pub fn capacity_for_budget(min_mb: u32, full_brick_bytes: usize) -> u32 {
    let wanted = ((min_mb as u64 * (1 << 20)) / full_brick_bytes.max(1) as u64).max(1);
    wanted.next_power_of_two() as u32
}

/// CPU-side mirror of the GPU miss-report table: fixed capacity, linear
/// probing, one entry per distinct brick id reported this frame.
pub struct GpuHashtable {
    capacity: u32,
    max_probe_attempts: u32,
    slots: Vec<u32>,
}

impl GpuHashtable {
    pub fn new(min_mb: u32, full_brick_bytes: usize) -> Self {
        let capacity = capacity_for_budget(min_mb, full_brick_bytes);
        Self {
            capacity,
            // A full linear scan of the table bounds worst-case probing;
            // in practice the table runs well under capacity.
            max_probe_attempts: capacity,
            slots: vec![EMPTY_SLOT; capacity as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn max_probing_attempts(&self) -> u32 {
        self.max_probe_attempts
    }

    fn hash(&self, id: BrickId) -> u32 {
        // Fibonacci hashing: the multiplier is the closest odd integer to
        // 2^32 / golden ratio, same mixing the teacher uses for its GPU
        // brick-to-slot hash.
        id.wrapping_mul(2654435769) % self.capacity
    }

    /// Insert `id`, returning `false` if the table is full and every probe
    /// found an occupied slot holding a different id.
    pub fn insert(&mut self, id: BrickId) -> bool {
        let encoded = id + 1;
        let start = self.hash(id);
        for attempt in 0..self.capacity {
            let slot = (start + attempt) % self.capacity;
            if self.slots[slot as usize] == encoded {
                return true;
            }
            if self.slots[slot as usize] == EMPTY_SLOT {
                self.slots[slot as usize] = encoded;
                return true;
            }
        }
        false
    }

    /// The deduplicated set of reported misses, in slot order.
    pub fn drain(&mut self) -> Vec<BrickId> {
        let misses: Vec<BrickId> = self
            .slots
            .iter()
            .copied()
            .filter(|&s| s != EMPTY_SLOT)
            .map(|s| s - 1)
            .collect();
        self.clear();
        misses
    }

    pub fn clear(&mut self) {
        self.slots.fill(EMPTY_SLOT);
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|&&s| s != EMPTY_SLOT).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        // 1 MiB budget, 32768-byte bricks -> 32 slots wanted, already a power of two.
        assert_eq!(capacity_for_budget(1, 32768), 32);
        // 33 slots wanted should round up to the next power of two.
        assert_eq!(capacity_for_budget(1, 31772), 64);
    }

    #[test]
    fn insert_and_drain_deduplicates_repeated_ids() {
        let mut table = GpuHashtable::new(1, 32768);
        assert!(table.insert(5));
        assert!(table.insert(5));
        assert!(table.insert(9));
        assert_eq!(table.len(), 2);

        let mut misses = table.drain();
        misses.sort_unstable();
        assert_eq!(misses, vec![5, 9]);
        assert!(table.is_empty());
    }

    #[test]
    fn brick_id_zero_survives_the_zero_is_free_sentinel() {
        let mut table = GpuHashtable::new(1, 32768);
        assert!(table.is_empty());
        assert!(table.insert(0));
        assert_eq!(table.len(), 1);
        assert_eq!(table.drain(), vec![0]);
    }

    #[test]
    fn insert_fails_once_every_slot_holds_a_different_id() {
        let mut table = GpuHashtable::new(1, 32768);
        let capacity = table.capacity();
        for id in 0..capacity {
            assert!(table.insert(id));
        }
        assert!(!table.insert(capacity));
    }
}
