//! Region registry: owns every resident region, loads them on demand under a
//! per-tick budget, and saves and unloads them when nobody observes them.

use rustc_hash::FxHashMap;

use crate::coords::{RegionPos, SessionId, WorldId, region_order};
use crate::error::WorldError;
use crate::region::Region;
use crate::store::RegionStore;

/// Registry tuning.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Ticks a region must stay unobserved before it is unloaded.
    pub unload_grace_ticks: u32,
    /// Ticks between periodic saves of a modified region.
    pub save_interval_ticks: u32,
    /// Store loads allowed per tick.
    pub loads_per_tick: u32,
    /// Ticks a region stays unavailable after a failed load.
    pub load_retry_ticks: u64,
    /// Entity slots per region (at most `0xfffe`).
    pub max_entities_per_region: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unload_grace_ticks: 1200,
            save_interval_ticks: 300,
            loads_per_tick: 16,
            load_retry_ticks: 100,
            max_entities_per_region: 0xfffe,
        }
    }
}

/// What end-of-tick maintenance did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub saved: u32,
    pub unloaded: u32,
    pub failed: u32,
}

/// Resident regions of one world.
#[derive(Debug, Default)]
pub struct World {
    regions: FxHashMap<RegionPos, Region>,
    /// Regions whose last load failed, with the tick they may be retried.
    unavailable: FxHashMap<RegionPos, u64>,
}

impl World {
    pub fn region(&self, pos: RegionPos) -> Option<&Region> {
        self.regions.get(&pos)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Resident region coordinates in deterministic order.
    pub fn region_positions(&self) -> Vec<RegionPos> {
        let mut out: Vec<_> = self.regions.keys().copied().collect();
        out.sort_unstable_by_key(|p| region_order(*p));
        out
    }
}

/// Owner of all resident regions.
#[derive(Debug)]
pub struct RegionRegistry {
    config: RegistryConfig,
    worlds: FxHashMap<WorldId, World>,
    tick: u64,
    loads_this_tick: u32,
}

impl RegionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            worlds: FxHashMap::default(),
            tick: 0,
            loads_this_tick: 0,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn world(&self, world: WorldId) -> Option<&World> {
        self.worlds.get(&world)
    }

    /// Worlds that have been referenced, ascending.
    pub fn world_ids(&self) -> Vec<WorldId> {
        let mut ids: Vec<_> = self.worlds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn region(&self, world: WorldId, pos: RegionPos) -> Option<&Region> {
        self.worlds.get(&world)?.regions.get(&pos)
    }

    pub fn region_mut(&mut self, world: WorldId, pos: RegionPos) -> Option<&mut Region> {
        self.worlds.get_mut(&world)?.regions.get_mut(&pos)
    }

    /// Every resident region as `(world, pos)`, in deterministic order.
    pub fn resident_regions(&self) -> Vec<(WorldId, RegionPos)> {
        let mut out = Vec::new();
        for world in self.world_ids() {
            if let Some(w) = self.worlds.get(&world) {
                out.extend(w.region_positions().into_iter().map(|p| (world, p)));
            }
        }
        out
    }

    /// Returns the region, loading it from `store` if it is not resident.
    ///
    /// A region with no saved copy is created empty. Fails with
    /// [`WorldError::RegionPending`] when this tick's load budget is spent and
    /// with [`WorldError::RegionUnavailable`] while a failed load is backing off.
    pub fn get_or_load(
        &mut self,
        store: &mut dyn RegionStore,
        world: WorldId,
        pos: RegionPos,
    ) -> Result<&mut Region, WorldError> {
        let max_entities = self.config.max_entities_per_region;
        let tick = self.tick;
        let w = self.worlds.entry(world).or_default();

        if w.regions.contains_key(&pos) {
            return w
                .regions
                .get_mut(&pos)
                .ok_or(WorldError::RegionUnavailable { world, region: pos });
        }
        if let Some(&retry_at) = w.unavailable.get(&pos) {
            if tick < retry_at {
                return Err(WorldError::RegionUnavailable { world, region: pos });
            }
            w.unavailable.remove(&pos);
        }

        let region = if store.exists(world, pos) {
            if self.loads_this_tick >= self.config.loads_per_tick {
                return Err(WorldError::RegionPending { world, region: pos });
            }
            self.loads_this_tick += 1;
            match store.load(world, pos) {
                Ok(Some(state)) => Region::from_state(world, pos, state, max_entities),
                Ok(None) => Region::new(world, pos, max_entities),
                Err(e) => {
                    tracing::warn!(?world, %pos, error = %e, "region load failed");
                    w.unavailable
                        .insert(pos, tick + self.config.load_retry_ticks.max(1));
                    return Err(WorldError::RegionUnavailable { world, region: pos });
                }
            }
        } else {
            Region::new(world, pos, max_entities)
        };

        tracing::debug!(?world, %pos, "region resident");
        Ok(w.regions.entry(pos).or_insert(region))
    }

    /// Saves the region if modified, then drops it from memory.
    ///
    /// Refuses while the region has subscribers. A failed save keeps the
    /// region resident and dirty. Returns `Ok(false)` when it was not resident.
    pub fn unload_if_idle(
        &mut self,
        store: &mut dyn RegionStore,
        world: WorldId,
        pos: RegionPos,
    ) -> Result<bool, WorldError> {
        let Some(w) = self.worlds.get_mut(&world) else {
            return Ok(false);
        };
        let Some(region) = w.regions.get_mut(&pos) else {
            return Ok(false);
        };
        if region.subscriber_count() > 0 {
            return Err(WorldError::RegionObserved { world, region: pos });
        }
        if region.is_dirty() {
            store.save(world, pos, &region.to_state())?;
            region.mark_saved();
        }
        w.regions.remove(&pos);
        tracing::debug!(?world, %pos, "region unloaded");
        Ok(true)
    }

    /// Saves a region now if it is modified. Returns whether a save happened.
    pub fn save_region(
        &mut self,
        store: &mut dyn RegionStore,
        world: WorldId,
        pos: RegionPos,
    ) -> Result<bool, WorldError> {
        let Some(region) = self.region_mut(world, pos) else {
            return Ok(false);
        };
        if !region.is_dirty() {
            return Ok(false);
        }
        store.save(world, pos, &region.to_state())?;
        region.mark_saved();
        Ok(true)
    }

    /// Saves every modified region. Used at shutdown.
    pub fn save_all(&mut self, store: &mut dyn RegionStore) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for (world, pos) in self.resident_regions() {
            match self.save_region(store, world, pos) {
                Ok(true) => report.saved += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(?world, %pos, error = %e, "region save failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Registers `session` as an observer of a resident region.
    pub fn subscribe(&mut self, world: WorldId, pos: RegionPos, session: SessionId) -> bool {
        self.region_mut(world, pos)
            .is_some_and(|region| region.subscribe(session))
    }

    pub fn unsubscribe(&mut self, world: WorldId, pos: RegionPos, session: SessionId) -> bool {
        self.region_mut(world, pos)
            .is_some_and(|region| region.unsubscribe(session))
    }

    /// Periodic saves and grace-period unloads. Call once per tick, before
    /// [`RegionRegistry::end_tick`].
    pub fn maintain(&mut self, store: &mut dyn RegionStore) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let grace = self.config.unload_grace_ticks;
        let interval = self.config.save_interval_ticks;
        for (world, pos) in self.resident_regions() {
            let Some(region) = self.region_mut(world, pos) else {
                continue;
            };
            region.age();
            let idle = region.subscriber_count() == 0 && region.idle_ticks() >= grace;
            let save_due = region.is_dirty() && region.ticks_since_save() >= interval;

            if idle {
                match self.unload_if_idle(store, world, pos) {
                    Ok(true) => report.unloaded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(?world, %pos, error = %e, "region unload failed");
                        report.failed += 1;
                    }
                }
            } else if save_due {
                match self.save_region(store, world, pos) {
                    Ok(true) => report.saved += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(?world, %pos, error = %e, "periodic save failed");
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    /// Clears per-tick change tracking, releases quarantined entity slots and
    /// resets the load budget.
    pub fn end_tick(&mut self) {
        for w in self.worlds.values_mut() {
            for region in w.regions.values_mut() {
                region.end_tick();
            }
        }
        self.loads_this_tick = 0;
        self.tick += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::coords::ChunkIndex;
    use crate::store::{MemoryStore, RegionState};
    use glam::IVec3;

    const W: WorldId = WorldId(1);

    fn registry(config: RegistryConfig) -> RegionRegistry {
        RegionRegistry::new(config)
    }

    #[test]
    fn test_missing_region_created_empty() {
        let mut reg = registry(RegistryConfig::default());
        let mut store = MemoryStore::new();
        let region = reg.get_or_load(&mut store, W, IVec3::ZERO).unwrap();
        assert_eq!(region.chunk_indices().len(), 0);
        assert!(!region.is_dirty());
        assert_eq!(store.load_count(), 0);
        assert!(reg.world(W).is_some());
    }

    #[test]
    fn test_saved_region_loaded_once() {
        let mut reg = registry(RegistryConfig::default());
        let mut store = MemoryStore::new();
        let state = RegionState {
            chunks: vec![(ChunkIndex::from_raw(0).unwrap(), Chunk::filled(5))],
            entities: Vec::new(),
        };
        store.insert(W, IVec3::X, state);

        reg.get_or_load(&mut store, W, IVec3::X).unwrap();
        reg.get_or_load(&mut store, W, IVec3::X).unwrap();
        assert_eq!(store.load_count(), 1);
        assert!(reg.region(W, IVec3::X).unwrap().chunk(ChunkIndex::from_raw(0).unwrap()).is_some());
    }

    #[test]
    fn test_load_budget_defers_to_next_tick() {
        let mut reg = registry(RegistryConfig {
            loads_per_tick: 1,
            ..RegistryConfig::default()
        });
        let mut store = MemoryStore::new();
        store.insert(W, IVec3::X, RegionState::default());
        store.insert(W, IVec3::Y, RegionState::default());

        reg.get_or_load(&mut store, W, IVec3::X).unwrap();
        assert!(matches!(
            reg.get_or_load(&mut store, W, IVec3::Y),
            Err(WorldError::RegionPending { .. })
        ));
        reg.end_tick();
        assert!(reg.get_or_load(&mut store, W, IVec3::Y).is_ok());
    }

    #[test]
    fn test_failed_load_backs_off() {
        let mut reg = registry(RegistryConfig {
            load_retry_ticks: 2,
            ..RegistryConfig::default()
        });
        let mut store = MemoryStore::new();
        store.fail_load(W, IVec3::ZERO);

        assert!(matches!(
            reg.get_or_load(&mut store, W, IVec3::ZERO),
            Err(WorldError::RegionUnavailable { .. })
        ));
        store.heal_load(W, IVec3::ZERO);
        reg.end_tick();
        assert!(reg.get_or_load(&mut store, W, IVec3::ZERO).is_err());
        assert_eq!(store.load_count(), 1);
        reg.end_tick();
        assert!(reg.get_or_load(&mut store, W, IVec3::ZERO).is_ok());
    }

    #[test]
    fn test_unload_refused_while_observed() {
        let mut reg = registry(RegistryConfig::default());
        let mut store = MemoryStore::new();
        reg.get_or_load(&mut store, W, IVec3::ZERO).unwrap();
        reg.subscribe(W, IVec3::ZERO, SessionId(1));

        assert!(matches!(
            reg.unload_if_idle(&mut store, W, IVec3::ZERO),
            Err(WorldError::RegionObserved { .. })
        ));
        assert!(reg.region(W, IVec3::ZERO).is_some());
    }

    #[test]
    fn test_unload_saves_dirty_region_exactly_once() {
        let mut reg = registry(RegistryConfig::default());
        let mut store = MemoryStore::new();
        reg.get_or_load(&mut store, W, IVec3::ZERO)
            .unwrap()
            .set_chunk(ChunkIndex::from_raw(2).unwrap(), Chunk::filled(1));

        assert!(reg.unload_if_idle(&mut store, W, IVec3::ZERO).unwrap());
        assert_eq!(store.save_count(), 1);
        assert!(reg.region(W, IVec3::ZERO).is_none());
        assert!(!reg.unload_if_idle(&mut store, W, IVec3::ZERO).unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_failed_save_keeps_region_resident() {
        let mut reg = registry(RegistryConfig::default());
        let mut store = MemoryStore::new();
        reg.get_or_load(&mut store, W, IVec3::ZERO)
            .unwrap()
            .set_chunk(ChunkIndex::from_raw(2).unwrap(), Chunk::filled(1));
        store.set_fail_saves(true);

        assert!(reg.unload_if_idle(&mut store, W, IVec3::ZERO).is_err());
        let region = reg.region(W, IVec3::ZERO).unwrap();
        assert!(region.is_dirty());
    }

    #[test]
    fn test_maintain_unloads_after_grace() {
        let mut reg = registry(RegistryConfig {
            unload_grace_ticks: 3,
            ..RegistryConfig::default()
        });
        let mut store = MemoryStore::new();
        reg.get_or_load(&mut store, W, IVec3::ZERO).unwrap();

        for _ in 0..2 {
            assert_eq!(reg.maintain(&mut store).unloaded, 0);
            reg.end_tick();
        }
        assert_eq!(reg.maintain(&mut store).unloaded, 1);
        assert!(reg.region(W, IVec3::ZERO).is_none());
        // Clean region: nothing written.
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_maintain_saves_observed_region_periodically() {
        let mut reg = registry(RegistryConfig {
            save_interval_ticks: 2,
            ..RegistryConfig::default()
        });
        let mut store = MemoryStore::new();
        let region = reg.get_or_load(&mut store, W, IVec3::ZERO).unwrap();
        region.subscribe(SessionId(1));
        region.set_chunk(ChunkIndex::from_raw(0).unwrap(), Chunk::filled(1));

        reg.maintain(&mut store);
        reg.end_tick();
        assert_eq!(store.save_count(), 0);
        assert_eq!(reg.maintain(&mut store).saved, 1);
        assert_eq!(store.save_count(), 1);
        assert!(!reg.region(W, IVec3::ZERO).unwrap().is_dirty());
    }
}
