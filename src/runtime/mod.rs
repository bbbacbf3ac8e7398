//! The rendering-time paging system (components C8-C11): the brick-residency
//! page table, the transfer function and isovalue emptiness tests, the
//! background updater that keeps emptiness current, and the GPU brick atlas
//! itself.

pub mod atlas;
pub mod emptiness;
pub mod hashtable;
pub mod page_table;
pub mod transfer_function;

pub use atlas::{AtlasLayout, LevelData, SharedStorage, VolumeAtlas};
pub use emptiness::{EmptinessMode, EmptinessUpdater};
pub use hashtable::GpuHashtable;
pub use page_table::{PageMeta, BI_CHILD_EMPTY, BI_EMPTY, BI_FLAG_COUNT, BI_MISSING};
pub use transfer_function::{TransferFunction, TF_SIZE};
