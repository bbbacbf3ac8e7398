//! Core type aliases and re-exports

pub use glam::{UVec3, Vec3};

/// A linear index into the brick metadata array, ordered level-then-(z,y,x).
pub type BrickId = u32;
