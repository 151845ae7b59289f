#![cfg_attr(feature = "strict", deny(warnings))]

mod location;
mod reference;
mod spill;
mod store;

pub use location::{ChunkLocation, ChunkLocationTable};
pub use reference::{ChunkReferenceTracker, ManifestReferenceTracker, TrackerDesync};
pub use spill::{SpillFile, SpillStats, SPILL_UNIT};
pub use store::{BackingStoreStats, ChunkBackingStore, StoreError};

pub type Result<T> = std::result::Result<T, StoreError>;
