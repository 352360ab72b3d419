//! Simulated entities stored in region slots.

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::content::{ResourceId, ResourceKind, ResourceRef};
use crate::coords::{RegionPos, WorldId, region_of};

/// An entity as the world stores it.
///
/// `world` and `position` are authoritative: when they no longer match the
/// region holding the entity, the migration pass moves it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity definition id.
    pub def: ResourceId,
    pub world: WorldId,
    /// World-space centre.
    pub position: DVec3,
    /// Half size of the bounding box.
    pub half_extent: DVec3,
}

impl Entity {
    /// Point-sized entity.
    pub fn new(def: ResourceId, world: WorldId, position: DVec3) -> Self {
        Self {
            def,
            world,
            position,
            half_extent: DVec3::ZERO,
        }
    }

    pub fn with_half_extent(mut self, half_extent: DVec3) -> Self {
        self.half_extent = half_extent;
        self
    }

    /// Region the entity's position falls into.
    pub fn region(&self) -> RegionPos {
        region_of(self.position)
    }

    /// World-space bounding box `(min, max)`.
    pub fn bounds(&self) -> (DVec3, DVec3) {
        (
            self.position - self.half_extent,
            self.position + self.half_extent,
        )
    }

    pub fn def_ref(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::EntityDef, self.def)
    }
}
