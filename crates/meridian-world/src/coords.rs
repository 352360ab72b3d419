//! Identifiers and coordinate conventions shared by every world structure.
//!
//! Positions are in world units (`f64`). A chunk spans [`CHUNK_SIZE`] units on
//! each axis and a region is a cube of 4×4×4 chunks. Region coordinates are
//! integer grid cells of [`REGION_SIZE`] units.

use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

/// Edge length of a chunk in world units.
pub const CHUNK_SIZE: i32 = 16;
/// Chunks along each axis of a region.
pub const CHUNKS_PER_AXIS: i32 = 4;
/// Chunks in one region.
pub const CHUNKS_PER_REGION: usize = 64;
/// Edge length of a region in world units.
pub const REGION_SIZE: i32 = CHUNK_SIZE * CHUNKS_PER_AXIS;

/// Integer grid coordinate of a region.
pub type RegionPos = IVec3;

/// Slot of an entity inside its region's entity table.
pub type EntitySlot = u16;

/// Opaque world identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub u32);

/// Identifier of a connected session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Index of a chunk within its region, packed as `x | y << 2 | z << 4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIndex(u8);

impl ChunkIndex {
    /// Builds an index from a local chunk coordinate in `0..4` on each axis.
    pub fn from_local(local: IVec3) -> Option<Self> {
        let range = 0..CHUNKS_PER_AXIS;
        if range.contains(&local.x) && range.contains(&local.y) && range.contains(&local.z) {
            Some(Self((local.x | local.y << 2 | local.z << 4) as u8))
        } else {
            None
        }
    }

    /// Rebuilds an index from its packed form.
    pub fn from_raw(raw: u8) -> Option<Self> {
        (usize::from(raw) < CHUNKS_PER_REGION).then_some(Self(raw))
    }

    /// Packed form.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Local chunk coordinate inside the region.
    pub fn local(self) -> IVec3 {
        let v = i32::from(self.0);
        IVec3::new(v & 3, (v >> 2) & 3, (v >> 4) & 3)
    }

    /// All 64 indices in ascending order.
    pub fn all() -> impl Iterator<Item = ChunkIndex> {
        (0..CHUNKS_PER_REGION as u8).map(ChunkIndex)
    }
}

/// Stable address of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub world: WorldId,
    pub region: RegionPos,
    pub index: ChunkIndex,
}

/// Stable address of an entity. Changes only when the entity migrates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub world: WorldId,
    pub region: RegionPos,
    pub slot: EntitySlot,
}

/// Region containing a world-space position.
pub fn region_of(position: DVec3) -> RegionPos {
    (position / f64::from(REGION_SIZE)).floor().as_ivec3()
}

/// Total order over region coordinates, used wherever iteration must be
/// deterministic.
pub fn region_order(pos: RegionPos) -> (i32, i32, i32) {
    (pos.x, pos.y, pos.z)
}
