//! Authoritative world storage: regions, chunks, entity slots, persistence,
//! and cross-region entity migration.

pub mod chunk;
pub mod content;
pub mod coords;
pub mod entity;
pub mod error;
pub mod migration;
pub mod region;
pub mod registry;
pub mod slots;
pub mod store;

pub use chunk::{Chunk, NodePlacement, VoxelCube};
pub use content::{ContentDefinitions, ContentRegistry, ResourceId, ResourceKind, ResourceRef};
pub use coords::{
    CHUNK_SIZE, CHUNKS_PER_AXIS, CHUNKS_PER_REGION, ChunkIndex, ChunkKey, EntityKey, EntitySlot,
    REGION_SIZE, RegionPos, SessionId, WorldId, region_of,
};
pub use entity::Entity;
pub use error::{StoreError, WorldError};
pub use migration::MigrationOutcome;
pub use region::Region;
pub use registry::{MaintenanceReport, RegionRegistry, RegistryConfig};
pub use slots::SlotArena;
pub use store::{FsStore, MemoryStore, RegionState, RegionStore};
