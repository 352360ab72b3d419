//! A loaded region: chunks, entity slots, subscribers, and per-tick change
//! tracking.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::chunk::Chunk;
use crate::coords::{ChunkIndex, EntitySlot, RegionPos, SessionId, WorldId};
use crate::entity::Entity;
use crate::error::WorldError;
use crate::slots::SlotArena;
use crate::store::RegionState;

/// Resident copy of one region.
#[derive(Debug)]
pub struct Region {
    world: WorldId,
    pos: RegionPos,
    chunks: FxHashMap<ChunkIndex, Chunk>,
    entities: SlotArena<Entity>,
    subscribers: FxHashSet<SessionId>,
    dirty: bool,
    idle_ticks: u32,
    ticks_since_save: u32,
    changed_chunks: FxHashSet<ChunkIndex>,
    changed_entities: FxHashSet<EntitySlot>,
    despawned: Vec<EntitySlot>,
}

impl Region {
    /// Empty, clean region.
    pub fn new(world: WorldId, pos: RegionPos, max_entities: u16) -> Self {
        Self {
            world,
            pos,
            chunks: FxHashMap::default(),
            entities: SlotArena::new(max_entities),
            subscribers: FxHashSet::default(),
            dirty: false,
            idle_ticks: 0,
            ticks_since_save: 0,
            changed_chunks: FxHashSet::default(),
            changed_entities: FxHashSet::default(),
            despawned: Vec::new(),
        }
    }

    /// Rebuilds a region from persisted state. Entities beyond `max_entities`
    /// are dropped with a warning.
    pub fn from_state(world: WorldId, pos: RegionPos, state: RegionState, max_entities: u16) -> Self {
        let mut region = Self::new(world, pos, max_entities);
        region.chunks.extend(state.chunks);
        let mut dropped = 0usize;
        for entity in state.entities {
            if region.entities.insert(entity).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::warn!(?world, %pos, dropped, "stored region exceeds entity capacity");
        }
        region
    }

    /// Snapshot for persistence. Chunks are sorted by index.
    pub fn to_state(&self) -> RegionState {
        let mut chunks: Vec<_> = self.chunks.iter().map(|(i, c)| (*i, c.clone())).collect();
        chunks.sort_unstable_by_key(|(i, _)| *i);
        RegionState {
            chunks,
            entities: self.entities.iter().map(|(_, e)| e.clone()).collect(),
        }
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    pub fn pos(&self) -> RegionPos {
        self.pos
    }

    // -- chunks --

    pub fn chunk(&self, index: ChunkIndex) -> Option<&Chunk> {
        self.chunks.get(&index)
    }

    /// Present chunk indices in ascending order.
    pub fn chunk_indices(&self) -> Vec<ChunkIndex> {
        let mut indices: Vec<_> = self.chunks.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Replaces a chunk's content and marks it changed.
    pub fn set_chunk(&mut self, index: ChunkIndex, chunk: Chunk) {
        self.chunks.insert(index, chunk);
        self.changed_chunks.insert(index);
        self.dirty = true;
    }

    pub fn remove_chunk(&mut self, index: ChunkIndex) -> Option<Chunk> {
        let removed = self.chunks.remove(&index)?;
        self.changed_chunks.insert(index);
        self.dirty = true;
        Some(removed)
    }

    // -- entities --

    pub fn entity(&self, slot: EntitySlot) -> Option<&Entity> {
        self.entities.get(slot)
    }

    /// Occupied entity slots in ascending order.
    pub fn entities(&self) -> impl Iterator<Item = (EntitySlot, &Entity)> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Places a new entity in the lowest free slot.
    pub fn spawn(&mut self, entity: Entity) -> Result<EntitySlot, WorldError> {
        let slot = self.entities.insert(entity).map_err(|_| WorldError::RegionFull {
            world: self.world,
            region: self.pos,
        })?;
        self.dirty = true;
        Ok(slot)
    }

    /// Applies `f` to an entity and marks it changed.
    pub fn update_entity<R>(&mut self, slot: EntitySlot, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        let entity = self.entities.get_mut(slot)?;
        let out = f(entity);
        self.changed_entities.insert(slot);
        self.dirty = true;
        Some(out)
    }

    /// Destroys an entity. Observers learn about it through [`Region::despawned`].
    pub fn despawn(&mut self, slot: EntitySlot) -> Option<Entity> {
        let entity = self.take_entity(slot)?;
        self.despawned.push(slot);
        Some(entity)
    }

    /// Removes an entity without recording a despawn; used when it moves to
    /// another region.
    pub(crate) fn take_entity(&mut self, slot: EntitySlot) -> Option<Entity> {
        let entity = self.entities.remove(slot)?;
        self.changed_entities.remove(&slot);
        self.dirty = true;
        Some(entity)
    }

    /// Inserts a migrating entity, returning it back when no slot is free.
    /// The new slot counts as changed so observers get its latest position.
    pub(crate) fn accept_entity(&mut self, entity: Entity) -> Result<EntitySlot, Entity> {
        let slot = self.entities.insert(entity)?;
        self.changed_entities.insert(slot);
        self.dirty = true;
        Ok(slot)
    }

    pub fn has_free_slot(&self) -> bool {
        self.entities.has_vacancy()
    }

    // -- subscribers --

    /// Returns `true` if the session was not yet subscribed.
    pub fn subscribe(&mut self, session: SessionId) -> bool {
        self.idle_ticks = 0;
        self.subscribers.insert(session)
    }

    pub fn unsubscribe(&mut self, session: SessionId) -> bool {
        self.subscribers.remove(&session)
    }

    pub fn is_subscribed(&self, session: SessionId) -> bool {
        self.subscribers.contains(&session)
    }

    /// Subscribed sessions in ascending order.
    pub fn subscribers(&self) -> Vec<SessionId> {
        let mut out: Vec<_> = self.subscribers.iter().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // -- change tracking --

    /// Whether the region differs from what was last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
        self.ticks_since_save = 0;
    }

    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    pub fn ticks_since_save(&self) -> u32 {
        self.ticks_since_save
    }

    /// Chunks modified this tick, ascending.
    pub fn changed_chunks(&self) -> Vec<ChunkIndex> {
        let mut out: Vec<_> = self.changed_chunks.iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Entities modified this tick, ascending.
    pub fn changed_entities(&self) -> Vec<EntitySlot> {
        let mut out: Vec<_> = self.changed_entities.iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Entities despawned this tick, in despawn order.
    pub fn despawned(&self) -> &[EntitySlot] {
        &self.despawned
    }

    /// Advances idle and save counters.
    pub(crate) fn age(&mut self) {
        if self.subscribers.is_empty() {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
        } else {
            self.idle_ticks = 0;
        }
        self.ticks_since_save = self.ticks_since_save.saturating_add(1);
    }

    /// Clears per-tick change sets and releases quarantined entity slots.
    pub(crate) fn end_tick(&mut self) {
        self.changed_chunks.clear();
        self.changed_entities.clear();
        self.despawned.clear();
        self.entities.commit_released();
    }
}
