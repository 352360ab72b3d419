//! Per-session subscription diffing.
//!
//! A [`SubscriptionTracker`] remembers which regions, chunks and entities its
//! session currently holds. On each visit it compares that against what the
//! session's view circles cover now and reports the differences, in order, to
//! an [`EventSink`]:
//!
//! - regions no longer covered: every chunk and entity lost, then the region lost;
//! - regions newly covered: loaded, region entered, then their visible contents;
//! - regions still covered: contents that left or entered the circles.
//!
//! A region that cannot be loaded, or whose entry the sink rejects, is
//! deferred and retried on the next visit. It is never reported as lost.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use meridian_world::{
    ChunkIndex, ChunkKey, EntityKey, EntitySlot, RegionPos, RegionRegistry, RegionStore, SessionId,
    WorldId,
};

use crate::error::SyncError;
use crate::view::{ViewCircle, chunk_visible, covered_regions, entity_visible};

type RegionKey = (WorldId, RegionPos);

fn region_key_order(key: &RegionKey) -> (WorldId, i32, i32, i32) {
    (key.0, key.1.x, key.1.y, key.1.z)
}

/// A change in what a session observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionEvent {
    RegionEntered { world: WorldId, region: RegionPos },
    RegionLost { world: WorldId, region: RegionPos },
    ChunkEntered(ChunkKey),
    ChunkLost(ChunkKey),
    EntityEntered(EntityKey),
    EntityLost(EntityKey),
}

/// Consumer of subscription events.
///
/// An error from an `*Entered` event means the object could not be served
/// now; the tracker leaves it unsubscribed and tries again next visit.
pub trait EventSink {
    fn on_event(&mut self, registry: &RegionRegistry, event: SubscriptionEvent) -> Result<(), SyncError>;
}

/// Counts from one visit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VisitReport {
    pub regions_entered: usize,
    pub regions_lost: usize,
    pub regions_deferred: usize,
}

#[derive(Debug, Default, Clone)]
struct Membership {
    chunks: BTreeSet<ChunkIndex>,
    entities: BTreeSet<EntitySlot>,
}

/// What one session currently observes.
#[derive(Debug)]
pub struct SubscriptionTracker {
    session: SessionId,
    circles: Vec<ViewCircle>,
    regions: FxHashMap<RegionKey, Membership>,
    deferred: FxHashSet<RegionKey>,
}

impl SubscriptionTracker {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            circles: Vec::new(),
            regions: FxHashMap::default(),
            deferred: FxHashSet::default(),
        }
    }

    /// Circles from the most recent visit.
    pub fn circles(&self) -> &[ViewCircle] {
        &self.circles
    }

    /// Re-diffs everything against `circles`.
    pub fn visit(
        &mut self,
        circles: Vec<ViewCircle>,
        registry: &mut RegionRegistry,
        store: &mut dyn RegionStore,
        sink: &mut dyn EventSink,
    ) -> VisitReport {
        self.circles = circles;
        let covered: Vec<RegionKey> = covered_regions(&self.circles);
        let covered_set: FxHashSet<RegionKey> = covered.iter().copied().collect();
        let mut report = VisitReport::default();

        let mut lost: Vec<RegionKey> = self
            .regions
            .keys()
            .filter(|k| !covered_set.contains(k))
            .copied()
            .collect();
        lost.sort_unstable_by_key(region_key_order);
        for key in lost {
            self.leave_region(key, registry, sink);
            report.regions_lost += 1;
        }
        self.deferred.retain(|k| covered_set.contains(k));

        for key in covered {
            if !self.regions.contains_key(&key) {
                if !self.enter_region(key, registry, store, sink) {
                    report.regions_deferred += 1;
                    continue;
                }
                report.regions_entered += 1;
            }
            self.diff_contents(key, registry, sink);
        }
        report
    }

    fn enter_region(
        &mut self,
        key: RegionKey,
        registry: &mut RegionRegistry,
        store: &mut dyn RegionStore,
        sink: &mut dyn EventSink,
    ) -> bool {
        let (world, pos) = key;
        match registry.get_or_load(store, world, pos) {
            Ok(region) => {
                region.subscribe(self.session);
            }
            Err(e) => {
                tracing::debug!(session = ?self.session, ?world, %pos, error = %e, "region deferred");
                self.deferred.insert(key);
                return false;
            }
        }
        let event = SubscriptionEvent::RegionEntered { world, region: pos };
        if let Err(e) = sink.on_event(registry, event) {
            tracing::warn!(session = ?self.session, ?world, %pos, error = %e, "region entry rejected");
            registry.unsubscribe(world, pos, self.session);
            self.deferred.insert(key);
            return false;
        }
        self.deferred.remove(&key);
        self.regions.insert(key, Membership::default());
        true
    }

    fn leave_region(&mut self, key: RegionKey, registry: &mut RegionRegistry, sink: &mut dyn EventSink) {
        let (world, region) = key;
        let Some(membership) = self.regions.remove(&key) else {
            return;
        };
        for index in membership.chunks {
            emit_release(sink, registry, SubscriptionEvent::ChunkLost(ChunkKey { world, region, index }));
        }
        for slot in membership.entities {
            emit_release(sink, registry, SubscriptionEvent::EntityLost(EntityKey { world, region, slot }));
        }
        emit_release(sink, registry, SubscriptionEvent::RegionLost { world, region });
        registry.unsubscribe(world, region, self.session);
    }

    fn diff_contents(&mut self, key: RegionKey, registry: &RegionRegistry, sink: &mut dyn EventSink) {
        let (world, pos) = key;
        let Some(region) = registry.region(world, pos) else {
            return;
        };
        let chunks: BTreeSet<ChunkIndex> = region
            .chunk_indices()
            .into_iter()
            .filter(|&index| chunk_visible(&self.circles, world, pos, index))
            .collect();
        let entities: BTreeSet<EntitySlot> = region
            .entities()
            .filter(|(_, entity)| entity_visible(&self.circles, world, entity))
            .map(|(slot, _)| slot)
            .collect();

        let Some(membership) = self.regions.get_mut(&key) else {
            return;
        };

        let gone_chunks: Vec<_> = membership.chunks.difference(&chunks).copied().collect();
        for index in gone_chunks {
            membership.chunks.remove(&index);
            emit_release(sink, registry, SubscriptionEvent::ChunkLost(ChunkKey { world, region: pos, index }));
        }
        let gone_entities: Vec<_> = membership.entities.difference(&entities).copied().collect();
        for slot in gone_entities {
            membership.entities.remove(&slot);
            emit_release(sink, registry, SubscriptionEvent::EntityLost(EntityKey { world, region: pos, slot }));
        }

        for index in chunks {
            if membership.chunks.contains(&index) {
                continue;
            }
            let event = SubscriptionEvent::ChunkEntered(ChunkKey { world, region: pos, index });
            match sink.on_event(registry, event) {
                Ok(()) => {
                    membership.chunks.insert(index);
                }
                Err(e) => tracing::debug!(session = ?self.session, ?event, error = %e, "chunk deferred"),
            }
        }
        for slot in entities {
            if membership.entities.contains(&slot) {
                continue;
            }
            let event = SubscriptionEvent::EntityEntered(EntityKey { world, region: pos, slot });
            match sink.on_event(registry, event) {
                Ok(()) => {
                    membership.entities.insert(slot);
                }
                Err(e) => tracing::debug!(session = ?self.session, ?event, error = %e, "entity deferred"),
            }
        }
    }

    // -- queries and out-of-visit adjustments --

    pub fn is_subscribed(&self, world: WorldId, region: RegionPos) -> bool {
        self.regions.contains_key(&(world, region))
    }

    /// Regions currently held, in deterministic order.
    pub fn subscribed_regions(&self) -> Vec<(WorldId, RegionPos)> {
        let mut out: Vec<_> = self.regions.keys().copied().collect();
        out.sort_unstable_by_key(region_key_order);
        out
    }

    /// Regions waiting for a later visit.
    pub fn deferred_regions(&self) -> usize {
        self.deferred.len()
    }

    pub fn holds_chunk(&self, key: ChunkKey) -> bool {
        self.regions
            .get(&(key.world, key.region))
            .is_some_and(|m| m.chunks.contains(&key.index))
    }

    pub fn holds_entity(&self, key: EntityKey) -> bool {
        self.regions
            .get(&(key.world, key.region))
            .is_some_and(|m| m.entities.contains(&key.slot))
    }

    /// Whether `key` is inside a held region and the current circles.
    pub fn sees_chunk(&self, registry: &RegionRegistry, key: ChunkKey) -> bool {
        self.is_subscribed(key.world, key.region)
            && registry
                .region(key.world, key.region)
                .is_some_and(|r| r.chunk(key.index).is_some())
            && chunk_visible(&self.circles, key.world, key.region, key.index)
    }

    /// Records a chunk served outside a visit.
    pub fn adopt_chunk(&mut self, key: ChunkKey) -> bool {
        self.regions
            .get_mut(&(key.world, key.region))
            .is_some_and(|m| m.chunks.insert(key.index))
    }

    pub fn forget_chunk(&mut self, key: ChunkKey) -> bool {
        self.regions
            .get_mut(&(key.world, key.region))
            .is_some_and(|m| m.chunks.remove(&key.index))
    }

    /// Records an entity that arrived in a held region by migration.
    pub fn adopt_entity(&mut self, key: EntityKey) -> bool {
        self.regions
            .get_mut(&(key.world, key.region))
            .is_some_and(|m| m.entities.insert(key.slot))
    }

    pub fn forget_entity(&mut self, key: EntityKey) -> bool {
        self.regions
            .get_mut(&(key.world, key.region))
            .is_some_and(|m| m.entities.remove(&key.slot))
    }

    /// Drops every subscription at once without producing events.
    pub fn detach(&mut self, registry: &mut RegionRegistry) {
        for (world, region) in self.regions.keys() {
            registry.unsubscribe(*world, *region, self.session);
        }
        self.regions.clear();
        self.deferred.clear();
        self.circles.clear();
    }
}

/// Lost events only release references; a failure is logged and ignored.
fn emit_release(sink: &mut dyn EventSink, registry: &RegionRegistry, event: SubscriptionEvent) {
    if let Err(e) = sink.on_event(registry, event) {
        tracing::warn!(?event, error = %e, "release event failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DVec3, IVec3};
    use meridian_world::{Chunk, Entity, MemoryStore, RegistryConfig};

    const W: WorldId = WorldId(1);

    #[derive(Default)]
    struct Log {
        events: Vec<SubscriptionEvent>,
        reject_chunks: bool,
    }

    impl EventSink for Log {
        fn on_event(&mut self, _: &RegionRegistry, event: SubscriptionEvent) -> Result<(), SyncError> {
            if self.reject_chunks && matches!(event, SubscriptionEvent::ChunkEntered(_)) {
                return Err(SyncError::CompactIdExhausted {
                    space: crate::resource::IdSpace::Entity,
                });
            }
            self.events.push(event);
            Ok(())
        }
    }

    fn setup() -> (RegionRegistry, MemoryStore, SubscriptionTracker) {
        let mut registry = RegionRegistry::new(RegistryConfig::default());
        let mut store = MemoryStore::new();
        let region = registry.get_or_load(&mut store, W, IVec3::ZERO).unwrap();
        region.set_chunk(ChunkIndex::from_raw(0).unwrap(), Chunk::filled(1));
        region.spawn(Entity::new(1, W, DVec3::splat(8.0))).unwrap();
        (registry, store, SubscriptionTracker::new(SessionId(1)))
    }

    fn position(events: &[SubscriptionEvent], wanted: SubscriptionEvent) -> usize {
        events.iter().position(|e| *e == wanted).unwrap()
    }

    #[test]
    fn test_region_entered_before_contents() {
        let (mut registry, mut store, mut tracker) = setup();
        let mut log = Log::default();
        let circles = vec![ViewCircle::new(W, IVec3::ZERO, 1)];

        let report = tracker.visit(circles, &mut registry, &mut store, &mut log);
        let entered = position(&log.events, SubscriptionEvent::RegionEntered { world: W, region: IVec3::ZERO });
        let chunk = ChunkKey { world: W, region: IVec3::ZERO, index: ChunkIndex::from_raw(0).unwrap() };
        let entity = EntityKey { world: W, region: IVec3::ZERO, slot: 0 };
        assert!(entered < position(&log.events, SubscriptionEvent::ChunkEntered(chunk)));
        assert!(entered < position(&log.events, SubscriptionEvent::EntityEntered(entity)));
        assert!(report.regions_entered > 1);
        assert!(registry.region(W, IVec3::ZERO).unwrap().is_subscribed(SessionId(1)));
    }

    #[test]
    fn test_contents_lost_before_region() {
        let (mut registry, mut store, mut tracker) = setup();
        let mut log = Log::default();
        tracker.visit(vec![ViewCircle::new(W, IVec3::ZERO, 1)], &mut registry, &mut store, &mut log);
        log.events.clear();

        let far = vec![ViewCircle::new(W, IVec3::new(50, 0, 0), 0)];
        tracker.visit(far, &mut registry, &mut store, &mut log);
        let lost = position(&log.events, SubscriptionEvent::RegionLost { world: W, region: IVec3::ZERO });
        let chunk = ChunkKey { world: W, region: IVec3::ZERO, index: ChunkIndex::from_raw(0).unwrap() };
        assert!(position(&log.events, SubscriptionEvent::ChunkLost(chunk)) < lost);
        assert!(!registry.region(W, IVec3::ZERO).unwrap().is_subscribed(SessionId(1)));
        assert!(!tracker.is_subscribed(W, IVec3::ZERO));
    }

    #[test]
    fn test_revisit_without_changes_is_silent() {
        let (mut registry, mut store, mut tracker) = setup();
        let mut log = Log::default();
        let circles = vec![ViewCircle::new(W, IVec3::ZERO, 1)];
        tracker.visit(circles.clone(), &mut registry, &mut store, &mut log);
        log.events.clear();
        tracker.visit(circles, &mut registry, &mut store, &mut log);
        assert!(log.events.is_empty());
    }

    #[test]
    fn test_unloadable_region_deferred_not_lost() {
        let (mut registry, mut store, mut tracker) = setup();
        store.fail_load(W, IVec3::new(20, 0, 0));
        let mut log = Log::default();
        let report = tracker.visit(
            vec![ViewCircle::new(W, IVec3::new(20, 0, 0), 0)],
            &mut registry,
            &mut store,
            &mut log,
        );
        assert_eq!(report.regions_deferred, 1);
        assert_eq!(tracker.deferred_regions(), 1);
        assert!(log.events.is_empty());
    }

    #[test]
    fn test_rejected_chunk_retried_next_visit() {
        let (mut registry, mut store, mut tracker) = setup();
        let mut log = Log {
            reject_chunks: true,
            ..Log::default()
        };
        let circles = vec![ViewCircle::new(W, IVec3::ZERO, 1)];
        tracker.visit(circles.clone(), &mut registry, &mut store, &mut log);
        let chunk = ChunkKey { world: W, region: IVec3::ZERO, index: ChunkIndex::from_raw(0).unwrap() };
        assert!(!tracker.holds_chunk(chunk));

        log.reject_chunks = false;
        tracker.visit(circles, &mut registry, &mut store, &mut log);
        assert!(tracker.holds_chunk(chunk));
    }

    #[test]
    fn test_detach_unsubscribes_everything() {
        let (mut registry, mut store, mut tracker) = setup();
        let mut log = Log::default();
        tracker.visit(vec![ViewCircle::new(W, IVec3::ZERO, 1)], &mut registry, &mut store, &mut log);
        tracker.detach(&mut registry);
        assert!(tracker.subscribed_regions().is_empty());
        for (world, pos) in registry.resident_regions() {
            assert_eq!(registry.region(world, pos).unwrap().subscriber_count(), 0);
        }
    }
}
