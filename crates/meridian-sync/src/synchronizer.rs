//! Translates subscription events into outgoing records for one session.
//!
//! Every chunk and entity a session holds pins the full dependency closure of
//! its definitions in the session's [`ResourceUse`]. Records are queued so
//! that a `ResourceNew` always precedes the first record using it and a
//! `ResourceReleased` always follows the last record that needed it.

use rustc_hash::{FxHashMap, FxHashSet};

use meridian_world::{
    Chunk, ChunkKey, ContentDefinitions, EntityKey, RegionPos, RegionRegistry, ResourceKind,
    ResourceRef, SessionId, WorldId,
};

use crate::compact::CompactId;
use crate::error::SyncError;
use crate::record::{CompactNode, CompactVoxelCube, Record};
use crate::resource::{IdSpace, ResourceUse};
use crate::subscription::{EventSink, SubscriptionEvent};

fn world_ref(world: WorldId) -> ResourceRef {
    ResourceRef::new(ResourceKind::World, world.0)
}

/// Direct references plus everything they transitively depend on.
fn dependency_closure(content: &dyn ContentDefinitions, direct: &[ResourceRef]) -> Vec<ResourceRef> {
    let mut all: Vec<ResourceRef> = direct.to_vec();
    for &def in direct {
        all.extend(content.dependencies(def));
    }
    all.sort_unstable();
    all.dedup();
    all
}

/// Outgoing state of one session.
#[derive(Debug)]
pub struct SessionSynchronizer {
    session: SessionId,
    resources: ResourceUse,
    chunk_deps: FxHashMap<ChunkKey, Vec<ResourceRef>>,
    entity_deps: FxHashMap<EntityKey, Vec<ResourceRef>>,
    /// Held chunks whose latest content could not be sent yet.
    stale_chunks: FxHashSet<ChunkKey>,
    outgoing: Vec<Record>,
}

impl SessionSynchronizer {
    pub fn new(session: SessionId, compact_id_limit: u32) -> Self {
        Self {
            session,
            resources: ResourceUse::new(compact_id_limit),
            chunk_deps: FxHashMap::default(),
            entity_deps: FxHashMap::default(),
            stale_chunks: FxHashSet::default(),
            outgoing: Vec::new(),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn resources(&self) -> &ResourceUse {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceUse {
        &mut self.resources
    }

    /// Records queued since the last flush.
    pub fn pending(&self) -> &[Record] {
        &self.outgoing
    }

    pub fn push(&mut self, record: Record) {
        self.outgoing.push(record);
    }

    pub fn take_outgoing(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.outgoing)
    }

    /// Ends the tick after the queued records were handed to the transport.
    pub fn commit(&mut self) {
        self.resources.commit();
    }

    /// Event sink bound to a content source, for one visit.
    pub fn sink<'a>(&'a mut self, content: &'a dyn ContentDefinitions) -> SyncSink<'a> {
        SyncSink { sync: self, content }
    }

    // -- reference bookkeeping --

    /// Takes one reference on each of `refs`, queueing `ResourceNew` for
    /// first uses. On failure every reference taken here is dropped again and
    /// the queued records are discarded.
    fn acquire_all(&mut self, refs: &[ResourceRef]) -> Result<(), SyncError> {
        let mark = self.outgoing.len();
        for (taken, &resource) in refs.iter().enumerate() {
            match self.resources.to_compact(resource) {
                Ok(acquired) => {
                    if acquired.is_new {
                        self.outgoing.push(Record::ResourceNew {
                            kind: resource.kind,
                            compact: acquired.compact,
                            id: resource.id,
                        });
                    }
                }
                Err(e) => {
                    for &undo in &refs[..taken] {
                        self.resources.release(undo);
                    }
                    self.outgoing.truncate(mark);
                    tracing::warn!(session = ?self.session, ?resource, "compact ids exhausted");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn release_all(&mut self, refs: &[ResourceRef]) {
        for &resource in refs {
            if let Some(compact) = self.resources.release(resource) {
                self.outgoing.push(Record::ResourceReleased {
                    kind: resource.kind,
                    compact,
                });
            }
        }
    }

    fn compact(&mut self, resource: ResourceRef) -> Result<CompactId, SyncError> {
        self.resources
            .compact_of(resource)
            .ok_or_else(|| SyncError::Missing(format!("{resource:?}")))
    }

    fn world_compact(&mut self, world: WorldId) -> Result<CompactId, SyncError> {
        self.compact(world_ref(world))
    }

    // -- regions --

    pub fn region_entered(&mut self, world: WorldId, region: RegionPos) -> Result<(), SyncError> {
        self.acquire_all(&[world_ref(world)])?;
        let world = self.world_compact(world)?;
        self.outgoing.push(Record::RegionEntered { world, region });
        Ok(())
    }

    pub fn region_lost(&mut self, world: WorldId, region: RegionPos) -> Result<(), SyncError> {
        let compact = self.world_compact(world)?;
        self.outgoing.push(Record::RegionLost { world: compact, region });
        self.release_all(&[world_ref(world)]);
        Ok(())
    }

    // -- chunks --

    fn chunk_record(&mut self, key: ChunkKey, chunk: &Chunk) -> Result<Record, SyncError> {
        let world = self.world_compact(key.world)?;
        let mut voxels = Vec::with_capacity(chunk.voxels.len());
        for cube in &chunk.voxels {
            voxels.push(CompactVoxelCube {
                voxel: self.compact(ResourceRef::new(ResourceKind::Voxel, cube.voxel))?,
                min: cube.min,
                max: cube.max,
            });
        }
        let mut nodes = Vec::with_capacity(chunk.nodes.len());
        for node in &chunk.nodes {
            nodes.push(CompactNode {
                cell: node.cell,
                node: self.compact(ResourceRef::new(ResourceKind::Node, node.node))?,
            });
        }
        Ok(Record::ChunkData {
            world,
            region: key.region,
            index: key.index.raw(),
            voxels,
            nodes,
        })
    }

    pub fn chunk_entered(
        &mut self,
        registry: &RegionRegistry,
        content: &dyn ContentDefinitions,
        key: ChunkKey,
    ) -> Result<(), SyncError> {
        let chunk = registry
            .region(key.world, key.region)
            .and_then(|r| r.chunk(key.index))
            .ok_or_else(|| SyncError::Missing(format!("{key:?}")))?;
        let deps = dependency_closure(content, &chunk.dependencies());
        self.acquire_all(&deps)?;
        let record = match self.chunk_record(key, chunk) {
            Ok(record) => record,
            Err(e) => {
                self.release_all(&deps);
                return Err(e);
            }
        };
        self.outgoing.push(record);
        self.chunk_deps.insert(key, deps);
        Ok(())
    }

    /// Resends a held chunk's full content, adjusting references by the
    /// difference between its old and new dependencies.
    pub fn chunk_changed(
        &mut self,
        registry: &RegionRegistry,
        content: &dyn ContentDefinitions,
        key: ChunkKey,
    ) -> Result<(), SyncError> {
        if !self.chunk_deps.contains_key(&key) {
            return Ok(());
        }
        let chunk = registry
            .region(key.world, key.region)
            .and_then(|r| r.chunk(key.index))
            .ok_or_else(|| SyncError::Missing(format!("{key:?}")))?;
        let deps = dependency_closure(content, &chunk.dependencies());
        if let Err(e) = self.acquire_all(&deps) {
            self.stale_chunks.insert(key);
            return Err(e);
        }
        let record = match self.chunk_record(key, chunk) {
            Ok(record) => record,
            Err(e) => {
                self.release_all(&deps);
                self.stale_chunks.insert(key);
                return Err(e);
            }
        };
        self.outgoing.push(record);
        let old = self.chunk_deps.insert(key, deps).unwrap_or_default();
        self.release_all(&old);
        self.stale_chunks.remove(&key);
        Ok(())
    }

    pub fn chunk_lost(&mut self, key: ChunkKey) -> Result<(), SyncError> {
        let Some(deps) = self.chunk_deps.remove(&key) else {
            return Ok(());
        };
        self.stale_chunks.remove(&key);
        let world = self.world_compact(key.world)?;
        self.outgoing.push(Record::ChunkLost {
            world,
            region: key.region,
            index: key.index.raw(),
        });
        self.release_all(&deps);
        Ok(())
    }

    /// Held chunks whose last update failed, sorted by world, region and index.
    pub fn stale_chunks(&self) -> Vec<ChunkKey> {
        let mut out: Vec<_> = self.stale_chunks.iter().copied().collect();
        out.sort_unstable_by_key(|k| (k.world, k.region.x, k.region.y, k.region.z, k.index));
        out
    }

    // -- entities --

    pub fn entity_entered(
        &mut self,
        registry: &RegionRegistry,
        content: &dyn ContentDefinitions,
        key: EntityKey,
    ) -> Result<(), SyncError> {
        let entity = registry
            .region(key.world, key.region)
            .and_then(|r| r.entity(key.slot))
            .ok_or_else(|| SyncError::Missing(format!("{key:?}")))?;
        let def = entity.def_ref();
        let deps = dependency_closure(content, &[def]);

        let mark = self.outgoing.len();
        self.acquire_all(&deps)?;
        let compact = match self.resources.entities_mut().to_compact(key) {
            Ok(acquired) => acquired.compact,
            Err(_) => {
                self.release_all(&deps);
                self.outgoing.truncate(mark);
                tracing::warn!(session = ?self.session, ?key, "entity compact ids exhausted");
                return Err(SyncError::CompactIdExhausted {
                    space: IdSpace::Entity,
                });
            }
        };
        let record = Record::EntityNew {
            entity: compact,
            def: self.compact(def)?,
            world: self.world_compact(key.world)?,
            position: entity.position,
            half_extent: entity.half_extent,
        };
        self.outgoing.push(record);
        self.entity_deps.insert(key, deps);
        Ok(())
    }

    pub fn entity_changed(&mut self, registry: &RegionRegistry, key: EntityKey) -> Result<(), SyncError> {
        let key = self.resources.entities_mut().resolve(key);
        let Some(compact) = self.resources.entities_mut().compact_of(key) else {
            return Ok(());
        };
        let entity = registry
            .region(key.world, key.region)
            .and_then(|r| r.entity(key.slot))
            .ok_or_else(|| SyncError::Missing(format!("{key:?}")))?;
        self.outgoing.push(Record::EntityUpdate {
            entity: compact,
            position: entity.position,
        });
        Ok(())
    }

    pub fn entity_lost(&mut self, key: EntityKey) -> Result<(), SyncError> {
        let key = self.resources.entities_mut().resolve(key);
        let Some(compact) = self.resources.entities_mut().release(key) else {
            return Ok(());
        };
        self.outgoing.push(Record::EntityLost { entity: compact });
        let deps = self.entity_deps.remove(&key).unwrap_or_default();
        self.release_all(&deps);
        Ok(())
    }

    /// Rebinds a held entity to its post-migration key, keeping its compact
    /// id. The destination region must be held by the session.
    pub fn entity_swapped(&mut self, from: EntityKey, to: EntityKey) -> Result<(), SyncError> {
        let world = self.world_compact(to.world)?;
        let Some(compact) = self.resources.entities_mut().rebind(from, to) else {
            return Ok(());
        };
        if let Some(deps) = self.entity_deps.remove(&from) {
            self.entity_deps.insert(to, deps);
        }
        self.outgoing.push(Record::EntitySwap {
            entity: compact,
            world,
            region: to.region,
        });
        Ok(())
    }

    /// Whether this session holds an entity under `key` (after redirects).
    pub fn holds_entity(&mut self, key: EntityKey) -> bool {
        let key = self.resources.entities_mut().resolve(key);
        self.resources.entities_mut().compact_of(key).is_some()
    }

    pub fn held_chunks(&self) -> usize {
        self.chunk_deps.len()
    }

    pub fn held_entities(&self) -> usize {
        self.entity_deps.len()
    }
}

/// [`EventSink`] applying events to a [`SessionSynchronizer`].
pub struct SyncSink<'a> {
    sync: &'a mut SessionSynchronizer,
    content: &'a dyn ContentDefinitions,
}

impl EventSink for SyncSink<'_> {
    fn on_event(&mut self, registry: &RegionRegistry, event: SubscriptionEvent) -> Result<(), SyncError> {
        match event {
            SubscriptionEvent::RegionEntered { world, region } => self.sync.region_entered(world, region),
            SubscriptionEvent::RegionLost { world, region } => self.sync.region_lost(world, region),
            SubscriptionEvent::ChunkEntered(key) => self.sync.chunk_entered(registry, self.content, key),
            SubscriptionEvent::ChunkLost(key) => self.sync.chunk_lost(key),
            SubscriptionEvent::EntityEntered(key) => self.sync.entity_entered(registry, self.content, key),
            SubscriptionEvent::EntityLost(key) => self.sync.entity_lost(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DVec3, IVec3};
    use meridian_world::{ChunkIndex, ContentRegistry, Entity, MemoryStore, RegistryConfig};

    const W: WorldId = WorldId(3);

    fn chunk_key(raw: u8) -> ChunkKey {
        ChunkKey {
            world: W,
            region: IVec3::ZERO,
            index: ChunkIndex::from_raw(raw).unwrap(),
        }
    }

    fn world_with_chunks(chunks: &[(u8, Chunk)]) -> RegionRegistry {
        let mut registry = RegionRegistry::new(RegistryConfig::default());
        let mut store = MemoryStore::new();
        let region = registry.get_or_load(&mut store, W, IVec3::ZERO).unwrap();
        for (raw, chunk) in chunks {
            region.set_chunk(ChunkIndex::from_raw(*raw).unwrap(), chunk.clone());
        }
        registry
    }

    fn new_records(records: &[Record], kind: ResourceKind) -> usize {
        records
            .iter()
            .filter(|r| matches!(r, Record::ResourceNew { kind: k, .. } if *k == kind))
            .count()
    }

    #[test]
    fn test_region_entered_announces_world_once() {
        let mut sync = SessionSynchronizer::new(SessionId(1), 16);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        sync.region_entered(W, IVec3::X).unwrap();
        let records = sync.take_outgoing();
        assert_eq!(new_records(&records, ResourceKind::World), 1);
        assert!(matches!(records[0], Record::ResourceNew { kind: ResourceKind::World, .. }));
        assert!(matches!(records[1], Record::RegionEntered { .. }));
        assert_eq!(sync.resources_mut().refcount(world_ref(W)), 2);
    }

    #[test]
    fn test_chunk_pins_transitive_dependencies() {
        let mut content = ContentRegistry::new();
        content.define(
            ResourceRef::new(ResourceKind::Voxel, 5),
            [ResourceRef::new(ResourceKind::Texture, 50)],
        );
        let registry = world_with_chunks(&[(0, Chunk::filled(5))]);
        let mut sync = SessionSynchronizer::new(SessionId(1), 16);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        sync.chunk_entered(&registry, &content, chunk_key(0)).unwrap();

        let texture = ResourceRef::new(ResourceKind::Texture, 50);
        assert_eq!(sync.resources_mut().refcount(texture), 1);
        sync.chunk_lost(chunk_key(0)).unwrap();
        assert_eq!(sync.resources_mut().refcount(texture), 0);

        let records = sync.take_outgoing();
        let lost = records.iter().position(|r| matches!(r, Record::ChunkLost { .. })).unwrap();
        let released = records
            .iter()
            .position(|r| matches!(r, Record::ResourceReleased { kind: ResourceKind::Texture, .. }))
            .unwrap();
        assert!(lost < released);
    }

    #[test]
    fn test_exhaustion_rolls_back_partial_acquire() {
        let content = ContentRegistry::new();
        let mut chunk = Chunk::filled(1);
        chunk.voxels.push(meridian_world::VoxelCube {
            voxel: 2,
            min: [0; 3],
            max: [1; 3],
        });
        let registry = world_with_chunks(&[(0, chunk)]);
        let mut sync = SessionSynchronizer::new(SessionId(1), 1);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        let before = sync.pending().len();

        assert!(matches!(
            sync.chunk_entered(&registry, &content, chunk_key(0)),
            Err(SyncError::CompactIdExhausted { .. })
        ));
        assert_eq!(sync.pending().len(), before);
        assert_eq!(sync.resources_mut().refcount(ResourceRef::new(ResourceKind::Voxel, 1)), 0);
        assert!(sync.resources().is_consistent());
    }

    #[test]
    fn test_stale_chunks_listed_in_index_order() {
        let content = ContentRegistry::new();
        let mut registry = world_with_chunks(&[
            (9, Chunk::filled(1)),
            (2, Chunk::filled(1)),
            (5, Chunk::filled(1)),
        ]);
        let mut sync = SessionSynchronizer::new(SessionId(1), 1);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        for raw in [9, 2, 5] {
            sync.chunk_entered(&registry, &content, chunk_key(raw)).unwrap();
        }

        // Voxel 1 keeps the only id, so switching to voxel 2 cannot be sent.
        for raw in [9, 2, 5] {
            registry
                .region_mut(W, IVec3::ZERO)
                .unwrap()
                .set_chunk(ChunkIndex::from_raw(raw).unwrap(), Chunk::filled(2));
            assert!(sync.chunk_changed(&registry, &content, chunk_key(raw)).is_err());
        }
        assert_eq!(sync.stale_chunks(), vec![chunk_key(2), chunk_key(5), chunk_key(9)]);
    }

    #[test]
    fn test_chunk_change_diffs_dependencies() {
        let content = ContentRegistry::new();
        let mut registry = world_with_chunks(&[(0, Chunk::filled(1))]);
        let mut sync = SessionSynchronizer::new(SessionId(1), 16);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        sync.chunk_entered(&registry, &content, chunk_key(0)).unwrap();
        sync.take_outgoing();

        registry
            .region_mut(W, IVec3::ZERO)
            .unwrap()
            .set_chunk(ChunkIndex::from_raw(0).unwrap(), Chunk::filled(2));
        sync.chunk_changed(&registry, &content, chunk_key(0)).unwrap();
        let records = sync.take_outgoing();
        assert!(matches!(records[0], Record::ResourceNew { kind: ResourceKind::Voxel, id: 2, .. }));
        assert!(matches!(records[1], Record::ChunkData { .. }));
        assert!(matches!(records[2], Record::ResourceReleased { kind: ResourceKind::Voxel, .. }));
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_entity_lifecycle() {
        let mut content = ContentRegistry::new();
        content.define(
            ResourceRef::new(ResourceKind::EntityDef, 7),
            [ResourceRef::new(ResourceKind::Model, 70)],
        );
        let mut registry = RegionRegistry::new(RegistryConfig::default());
        let mut store = MemoryStore::new();
        registry
            .get_or_load(&mut store, W, IVec3::ZERO)
            .unwrap()
            .spawn(Entity::new(7, W, DVec3::splat(4.0)))
            .unwrap();
        let key = EntityKey {
            world: W,
            region: IVec3::ZERO,
            slot: 0,
        };

        let mut sync = SessionSynchronizer::new(SessionId(1), 16);
        sync.region_entered(W, IVec3::ZERO).unwrap();
        sync.entity_entered(&registry, &content, key).unwrap();
        assert!(sync.holds_entity(key));
        sync.entity_changed(&registry, key).unwrap();
        sync.entity_lost(key).unwrap();
        assert!(!sync.holds_entity(key));

        let records = sync.take_outgoing();
        assert!(records.iter().any(|r| matches!(r, Record::EntityNew { .. })));
        assert!(records.iter().any(|r| matches!(r, Record::EntityUpdate { .. })));
        assert_eq!(new_records(&records, ResourceKind::Model), 1);
        assert!(matches!(
            records.last(),
            Some(Record::ResourceReleased { .. })
        ));
        assert!(sync.resources().is_consistent());
    }
}
