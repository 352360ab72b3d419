//! A connected session: its anchor, subscriptions and outgoing records.

use glam::DVec3;

use meridian_world::{
    ChunkKey, ContentDefinitions, EntityKey, MigrationOutcome, RegionRegistry, RegionStore,
    SessionId, WorldId,
};

use crate::error::SyncError;
use crate::record::Record;
use crate::subscription::{SubscriptionTracker, VisitReport};
use crate::synchronizer::SessionSynchronizer;
use crate::transport::Transport;
use crate::view::ViewCircle;

/// Where a session looks from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub world: WorldId,
    pub position: DVec3,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    anchor: Anchor,
    tracker: SubscriptionTracker,
    sync: SessionSynchronizer,
    last_visit: Option<u64>,
}

impl Session {
    pub fn new(id: SessionId, anchor: Anchor, compact_id_limit: u32) -> Self {
        Self {
            id,
            anchor,
            tracker: SubscriptionTracker::new(id),
            sync: SessionSynchronizer::new(id, compact_id_limit),
            last_visit: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn set_anchor(&mut self, anchor: Anchor) {
        self.anchor = anchor;
    }

    pub fn tracker(&self) -> &SubscriptionTracker {
        &self.tracker
    }

    pub fn synchronizer(&self) -> &SessionSynchronizer {
        &self.sync
    }

    pub fn synchronizer_mut(&mut self) -> &mut SessionSynchronizer {
        &mut self.sync
    }

    /// Tick of the most recent visibility pass.
    pub fn last_visit(&self) -> Option<u64> {
        self.last_visit
    }

    /// Visibility pass: diff against `circles` and queue the resulting records.
    pub fn visit(
        &mut self,
        tick: u64,
        circles: Vec<ViewCircle>,
        registry: &mut RegionRegistry,
        store: &mut dyn RegionStore,
        content: &dyn ContentDefinitions,
    ) -> VisitReport {
        self.last_visit = Some(tick);
        let mut sink = self.sync.sink(content);
        self.tracker.visit(circles, registry, store, &mut sink)
    }

    /// Reacts to one entity migration this session may be observing.
    pub fn on_migration(&mut self, outcome: MigrationOutcome) {
        let result = match outcome {
            MigrationOutcome::Moved { from, to } => {
                if !self.tracker.forget_entity(from) {
                    return;
                }
                if self.tracker.adopt_entity(to) {
                    self.sync.entity_swapped(from, to)
                } else {
                    self.sync.entity_lost(from)
                }
            }
            MigrationOutcome::Discarded { from } => {
                if !self.tracker.forget_entity(from) {
                    return;
                }
                self.sync.entity_lost(from)
            }
            MigrationOutcome::Deferred { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(session = ?self.id, ?outcome, error = %e, "migration update failed");
        }
    }

    /// Sends this tick's edits to held chunks and entities, and picks up new
    /// chunks appearing inside the current circles.
    pub fn apply_updates(&mut self, registry: &RegionRegistry, content: &dyn ContentDefinitions) {
        for key in self.sync.stale_chunks() {
            self.update_chunk(registry, content, key);
        }
        for (world, pos) in self.tracker.subscribed_regions() {
            let Some(region) = registry.region(world, pos) else {
                continue;
            };
            for index in region.changed_chunks() {
                self.update_chunk(registry, content, ChunkKey { world, region: pos, index });
            }
            for &slot in region.despawned() {
                let key = EntityKey { world, region: pos, slot };
                if self.tracker.forget_entity(key)
                    && let Err(e) = self.sync.entity_lost(key)
                {
                    tracing::warn!(session = ?self.id, ?key, error = %e, "entity removal failed");
                }
            }
            for slot in region.changed_entities() {
                let key = EntityKey { world, region: pos, slot };
                if self.tracker.holds_entity(key)
                    && let Err(e) = self.sync.entity_changed(registry, key)
                {
                    tracing::warn!(session = ?self.id, ?key, error = %e, "entity update failed");
                }
            }
        }
    }

    fn update_chunk(&mut self, registry: &RegionRegistry, content: &dyn ContentDefinitions, key: ChunkKey) {
        let result = if self.tracker.holds_chunk(key) {
            let exists = registry
                .region(key.world, key.region)
                .is_some_and(|r| r.chunk(key.index).is_some());
            if exists {
                self.sync.chunk_changed(registry, content, key)
            } else {
                self.tracker.forget_chunk(key);
                self.sync.chunk_lost(key)
            }
        } else if self.tracker.sees_chunk(registry, key) {
            self.sync
                .chunk_entered(registry, content, key)
                .map(|()| {
                    self.tracker.adopt_chunk(key);
                })
        } else {
            Ok(())
        };
        if let Err(e) = result {
            tracing::debug!(session = ?self.id, ?key, error = %e, "chunk update deferred");
        }
    }

    /// Queues a disconnect notice.
    pub fn kick(&mut self, reason: &str) {
        self.sync.push(Record::Disconnect {
            reason: reason.to_string(),
        });
    }

    /// Encodes and sends every queued record followed by a tick marker, then
    /// lets released compact ids be reused. Returns the number of records sent.
    pub fn flush(&mut self, tick: u64, transport: &mut dyn Transport) -> Result<usize, SyncError> {
        let mut records = self.sync.take_outgoing();
        records.push(Record::TickEnd { tick });
        for record in &records {
            transport.send(self.id, record.encode()?);
        }
        self.sync.commit();
        debug_assert!(self.sync.resources().is_consistent());
        Ok(records.len())
    }

    /// Drops all subscriptions at once. Queued records are discarded.
    pub fn detach(&mut self, registry: &mut RegionRegistry) {
        self.tracker.detach(registry);
        self.sync.take_outgoing();
    }
}
