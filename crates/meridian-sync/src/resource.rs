//! Per-session reference-counted resource tables.
//!
//! A session holds one [`ResourceTable`] per resource category plus one for
//! entities. Each held key maps to a compact id and a count of the chunks,
//! entities, or regions that currently need it. The client is told about a
//! key when its count goes from 0 to 1 and told to forget it when the count
//! returns to 0.

use std::hash::Hash;

use rustc_hash::FxHashMap;

use meridian_world::{EntityKey, ResourceId, ResourceKind, ResourceRef};

use crate::compact::{CompactId, CompactIdAllocator, Exhausted};
use crate::error::SyncError;
use crate::redirect::RedirectTable;

/// Which compact id space an id belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdSpace {
    Resource(ResourceKind),
    Entity,
}

/// Result of taking a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub compact: CompactId,
    /// The key was not held before; the client must be told about it.
    pub is_new: bool,
}

// ---------------------------------------------------------------------------
// ResourceTable
// ---------------------------------------------------------------------------

/// Reference counts and compact ids for one key space.
#[derive(Debug, Clone)]
pub struct ResourceTable<K> {
    held: FxHashMap<K, (CompactId, u32)>,
    ids: CompactIdAllocator<K>,
    redirects: RedirectTable<K>,
}

impl<K: Copy + Eq + Hash> ResourceTable<K> {
    /// Empty table handing out at most `limit` live compact ids.
    pub fn new(limit: u32) -> Self {
        Self {
            held: FxHashMap::default(),
            ids: CompactIdAllocator::new(limit),
            redirects: RedirectTable::new(),
        }
    }

    /// Takes one reference to `key`, allocating a compact id on first use.
    pub fn to_compact(&mut self, key: K) -> Result<Acquired, Exhausted> {
        let key = self.redirects.resolve(key);
        if let Some((compact, count)) = self.held.get_mut(&key) {
            *count += 1;
            return Ok(Acquired {
                compact: *compact,
                is_new: false,
            });
        }
        let compact = self.ids.allocate(key)?;
        self.held.insert(key, (compact, 1));
        Ok(Acquired {
            compact,
            is_new: true,
        })
    }

    /// Drops one reference. Returns the compact id when the last reference
    /// went away; the id stays quarantined until [`ResourceTable::commit`].
    pub fn release(&mut self, key: K) -> Option<CompactId> {
        let key = self.redirects.resolve(key);
        let Some((compact, count)) = self.held.get_mut(&key) else {
            tracing::warn!("released a reference that was not held");
            return None;
        };
        *count -= 1;
        if *count > 0 {
            return None;
        }
        let compact = *compact;
        self.held.remove(&key);
        self.ids.release(compact);
        Some(compact)
    }

    /// Key a client-supplied compact id stands for.
    pub fn from_compact(&self, compact: CompactId) -> Option<K> {
        self.ids.get(compact)
    }

    /// Compact id of a held key, following this tick's redirects.
    pub fn compact_of(&mut self, key: K) -> Option<CompactId> {
        let key = self.redirects.resolve(key);
        self.held.get(&key).map(|(compact, _)| *compact)
    }

    /// References held on `key` at its current address.
    pub fn refcount(&self, key: K) -> u32 {
        self.held.get(&key).map_or(0, |(_, count)| *count)
    }

    /// Current address of a key that may have been rebound this tick.
    pub fn resolve(&mut self, key: K) -> K {
        self.redirects.resolve(key)
    }

    /// Moves a held key to a new address, keeping its compact id and count.
    pub fn rebind(&mut self, old: K, new: K) -> Option<CompactId> {
        let old = self.redirects.resolve(old);
        let entry = self.held.remove(&old)?;
        self.ids.rebind(entry.0, new);
        self.held.insert(new, entry);
        self.redirects.redirect(old, new);
        Some(entry.0)
    }

    /// Ends the tick: released ids become reusable and redirects are dropped.
    pub fn commit(&mut self) {
        self.ids.commit_released();
        self.redirects.clear();
    }

    /// Number of held keys.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether no key is held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Every held key has a positive count and owns its compact id.
    pub fn is_consistent(&self) -> bool {
        self.ids.live() == self.held.len()
            && self
                .held
                .iter()
                .all(|(key, (compact, count))| *count > 0 && self.ids.get(*compact) == Some(*key))
    }
}

// ---------------------------------------------------------------------------
// ResourceUse
// ---------------------------------------------------------------------------

/// All resource tables of one session.
#[derive(Debug, Clone)]
pub struct ResourceUse {
    definitions: [ResourceTable<ResourceId>; ResourceKind::COUNT],
    entities: ResourceTable<EntityKey>,
}

impl ResourceUse {
    /// Tables allowing `limit` compact ids per category.
    pub fn new(limit: u32) -> Self {
        Self {
            definitions: std::array::from_fn(|_| ResourceTable::new(limit)),
            entities: ResourceTable::new(limit),
        }
    }

    /// Takes one reference to a definition in its kind's table.
    pub fn to_compact(&mut self, resource: ResourceRef) -> Result<Acquired, SyncError> {
        self.definitions[resource.kind.index()]
            .to_compact(resource.id)
            .map_err(|_| SyncError::CompactIdExhausted {
                space: IdSpace::Resource(resource.kind),
            })
    }

    /// Drops one reference; see [`ResourceTable::release`].
    pub fn release(&mut self, resource: ResourceRef) -> Option<CompactId> {
        self.definitions[resource.kind.index()].release(resource.id)
    }

    /// Resolves a client-supplied id. Unknown ids are an error.
    pub fn from_compact(&self, kind: ResourceKind, compact: CompactId) -> Result<ResourceId, SyncError> {
        self.definitions[kind.index()]
            .from_compact(compact)
            .ok_or(SyncError::UnknownCompactId {
                space: IdSpace::Resource(kind),
                compact,
            })
    }

    /// Compact id of a held definition.
    pub fn compact_of(&mut self, resource: ResourceRef) -> Option<CompactId> {
        self.definitions[resource.kind.index()].compact_of(resource.id)
    }

    /// References held on one definition.
    pub fn refcount(&self, resource: ResourceRef) -> u32 {
        self.definitions[resource.kind.index()].refcount(resource.id)
    }

    /// Entity table.
    pub fn entities(&self) -> &ResourceTable<EntityKey> {
        &self.entities
    }

    /// Entity table, for acquiring and rebinding migrating entities.
    pub fn entities_mut(&mut self) -> &mut ResourceTable<EntityKey> {
        &mut self.entities
    }

    /// Keys held in one category.
    pub fn held(&self, kind: ResourceKind) -> usize {
        self.definitions[kind.index()].len()
    }

    /// Commits every table at the end of a tick.
    pub fn commit(&mut self) {
        for table in &mut self.definitions {
            table.commit();
        }
        self.entities.commit();
    }

    /// Whether every table is consistent.
    pub fn is_consistent(&self) -> bool {
        self.definitions.iter().all(ResourceTable::is_consistent) && self.entities.is_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;
    use meridian_world::WorldId;

    fn voxel(id: ResourceId) -> ResourceRef {
        ResourceRef::new(ResourceKind::Voxel, id)
    }

    #[test]
    fn test_first_reference_is_new() {
        let mut table = ResourceTable::new(8);
        let first = table.to_compact(40u32).unwrap();
        let second = table.to_compact(40).unwrap();
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.compact, second.compact);
        assert_eq!(table.refcount(40), 2);
    }

    #[test]
    fn test_release_reports_last_reference() {
        let mut table = ResourceTable::new(8);
        let a = table.to_compact(1u32).unwrap().compact;
        table.to_compact(1).unwrap();
        assert_eq!(table.release(1), None);
        assert_eq!(table.release(1), Some(a));
        assert_eq!(table.from_compact(a), None);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_released_id_not_reused_before_commit() {
        let mut table = ResourceTable::new(8);
        let a = table.to_compact(1u32).unwrap().compact;
        table.release(1);
        let b = table.to_compact(2).unwrap().compact;
        assert_ne!(a, b);
        table.commit();
        assert_eq!(table.to_compact(3).unwrap().compact, a);
    }

    #[test]
    fn test_release_of_unheld_key_is_noop() {
        let mut table: ResourceTable<u32> = ResourceTable::new(8);
        assert_eq!(table.release(5), None);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_rebind_keeps_compact_and_redirects() {
        let mut table = ResourceTable::new(8);
        let old = EntityKey {
            world: WorldId(1),
            region: IVec3::ZERO,
            slot: 3,
        };
        let new = EntityKey {
            world: WorldId(1),
            region: IVec3::X,
            slot: 0,
        };
        let compact = table.to_compact(old).unwrap().compact;
        assert_eq!(table.rebind(old, new), Some(compact));
        assert_eq!(table.from_compact(compact), Some(new));
        assert_eq!(table.compact_of(old), Some(compact));
        assert_eq!(table.release(old), Some(compact));
        assert!(table.is_empty());

        table.commit();
        assert_eq!(table.resolve(old), old);
    }

    #[test]
    fn test_categories_are_independent() {
        let mut uses = ResourceUse::new(1);
        let v = uses.to_compact(voxel(7)).unwrap();
        let t = uses.to_compact(ResourceRef::new(ResourceKind::Texture, 7)).unwrap();
        assert_eq!(v.compact, t.compact);
        assert!(matches!(
            uses.to_compact(voxel(8)),
            Err(SyncError::CompactIdExhausted {
                space: IdSpace::Resource(ResourceKind::Voxel)
            })
        ));
        assert_eq!(uses.from_compact(ResourceKind::Voxel, v.compact).unwrap(), 7);
        assert!(uses.from_compact(ResourceKind::Node, v.compact).is_err());
        assert!(uses.is_consistent());
    }
}
