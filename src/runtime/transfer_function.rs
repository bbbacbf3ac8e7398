//! The 256-entry RGBA transfer function consulted by `EmptinessUpdater`'s
//! transfer-function emptiness test (ยง4.6).

use serde::{Deserialize, Serialize};

/// Fixed transfer-function resolution (ยง4.6: "tf_size").
pub const TF_SIZE: usize = 256;

/// A 256-entry RGBA lookup table mapping a normalized intensity bucket to
/// a display color and opacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferFunction {
    entries: Vec<[u8; 4]>,
}

impl TransferFunction {
    pub fn new(entries: Vec<[u8; 4]>) -> Self {
        assert_eq!(
            entries.len(),
            TF_SIZE,
            "transfer function must have exactly {TF_SIZE} entries"
        );
        Self { entries }
    }

    /// A fully transparent table: every brick will test empty.
    pub fn transparent() -> Self {
        Self {
            entries: vec![[0, 0, 0, 0]; TF_SIZE],
        }
    }

    pub fn entries(&self) -> &[[u8; 4]] {
        &self.entries
    }

    /// The lowest and highest indices with non-zero alpha, or `None` if
    /// every entry is fully transparent.
    pub fn alpha_index_bounds(&self) -> Option<(usize, usize)> {
        let min = self.entries.iter().position(|e| e[3] != 0)?;
        let max = self.entries.iter().rposition(|e| e[3] != 0)?;
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_transparent_table_has_no_alpha_bounds() {
        assert_eq!(TransferFunction::transparent().alpha_index_bounds(), None);
    }

    #[test]
    fn single_opaque_spike_bounds_are_its_own_index() {
        let mut entries = vec![[0u8, 0, 0, 0]; TF_SIZE];
        entries[128] = [255, 255, 255, 255];
        let tf = TransferFunction::new(entries);
        assert_eq!(tf.alpha_index_bounds(), Some((128, 128)));
    }

    #[test]
    fn widened_spike_widens_bounds() {
        let mut entries = vec![[0u8, 0, 0, 0]; TF_SIZE];
        for e in entries.iter_mut().take(193).skip(64) {
            *e = [255, 255, 255, 255];
        }
        let tf = TransferFunction::new(entries);
        assert_eq!(tf.alpha_index_bounds(), Some((64, 192)));
    }
}
