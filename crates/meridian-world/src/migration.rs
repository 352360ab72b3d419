//! Cross-region entity migration.
//!
//! An entity whose authoritative world or position no longer falls inside its
//! holding region is moved to the correct region, loading it if needed.

use crate::coords::{EntityKey, RegionPos, WorldId, region_order};
use crate::registry::RegionRegistry;
use crate::store::RegionStore;

/// Result of migrating one entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The entity now lives at `to`.
    Moved { from: EntityKey, to: EntityKey },
    /// The destination had no free slot; the entity was destroyed.
    Discarded { from: EntityKey },
    /// The destination could not be loaded this tick; retried next tick.
    Deferred { from: EntityKey },
}

impl MigrationOutcome {
    pub fn source(&self) -> EntityKey {
        match *self {
            MigrationOutcome::Moved { from, .. }
            | MigrationOutcome::Discarded { from }
            | MigrationOutcome::Deferred { from } => from,
        }
    }
}

struct Candidate {
    from: EntityKey,
    world: WorldId,
    region: RegionPos,
}

impl RegionRegistry {
    /// Moves every misplaced entity to the region it belongs in.
    ///
    /// Candidates are processed in world, region, slot order. Each entity
    /// leaves its source region only once the destination accepted it, so an
    /// entity is never held by two regions.
    pub fn migrate_entities(&mut self, store: &mut dyn RegionStore) -> Vec<MigrationOutcome> {
        let candidates = self.migration_candidates();
        let mut outcomes = Vec::with_capacity(candidates.len());

        for c in candidates {
            let has_room = match self.get_or_load(store, c.world, c.region) {
                Ok(dest) => dest.has_free_slot(),
                Err(e) => {
                    tracing::debug!(from = ?c.from, error = %e, "migration deferred");
                    outcomes.push(MigrationOutcome::Deferred { from: c.from });
                    continue;
                }
            };

            let Some(entity) = self
                .region_mut(c.from.world, c.from.region)
                .and_then(|src| src.take_entity(c.from.slot))
            else {
                continue;
            };

            if !has_room {
                tracing::warn!(from = ?c.from, dest = %c.region, "destination full, entity discarded");
                outcomes.push(MigrationOutcome::Discarded { from: c.from });
                continue;
            }

            let accepted = self
                .region_mut(c.world, c.region)
                .map(|dest| dest.accept_entity(entity));
            match accepted {
                Some(Ok(slot)) => outcomes.push(MigrationOutcome::Moved {
                    from: c.from,
                    to: EntityKey {
                        world: c.world,
                        region: c.region,
                        slot,
                    },
                }),
                _ => outcomes.push(MigrationOutcome::Discarded { from: c.from }),
            }
        }
        outcomes
    }

    fn migration_candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (world, pos) in self.resident_regions() {
            let Some(region) = self.region(world, pos) else {
                continue;
            };
            for (slot, entity) in region.entities() {
                let target = entity.region();
                if entity.world != world || target != pos {
                    out.push(Candidate {
                        from: EntityKey {
                            world,
                            region: pos,
                            slot,
                        },
                        world: entity.world,
                        region: target,
                    });
                }
            }
        }
        out.sort_by_key(|c| (c.from.world, region_order(c.from.region), c.from.slot));
        out
    }
}
