//! Region persistence.
//!
//! [`RegionStore`] is the seam between the registry and durable storage.
//! [`FsStore`] writes one lz4-compressed postcard file per region;
//! [`MemoryStore`] keeps everything in memory and can be told to fail.

use std::path::{Path, PathBuf};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::coords::{ChunkIndex, RegionPos, WorldId};
use crate::entity::Entity;
use crate::error::StoreError;

/// Persisted form of a region.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionState {
    pub chunks: Vec<(ChunkIndex, Chunk)>,
    pub entities: Vec<Entity>,
}

/// Durable region storage.
pub trait RegionStore {
    /// Whether a saved copy of the region exists.
    fn exists(&self, world: WorldId, region: RegionPos) -> bool;

    /// Reads a saved region. `Ok(None)` when nothing was saved.
    fn load(&mut self, world: WorldId, region: RegionPos) -> Result<Option<RegionState>, StoreError>;

    /// Replaces the saved copy of a region.
    fn save(&mut self, world: WorldId, region: RegionPos, state: &RegionState) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// FsStore
// ---------------------------------------------------------------------------

/// One file per region under `<root>/<world>/<x>_<y>_<z>.region`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn region_path(&self, world: WorldId, region: RegionPos) -> PathBuf {
        self.root
            .join(world.0.to_string())
            .join(format!("{}_{}_{}.region", region.x, region.y, region.z))
    }
}

/// Serializes and compresses a region.
pub fn encode_region(state: &RegionState) -> Result<Vec<u8>, StoreError> {
    let raw = postcard::to_allocvec(state).map_err(StoreError::Encode)?;
    Ok(compress_prepend_size(&raw))
}

/// Inverse of [`encode_region`].
pub fn decode_region(bytes: &[u8]) -> Result<RegionState, StoreError> {
    let raw = decompress_size_prepended(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    postcard::from_bytes(&raw).map_err(StoreError::Decode)
}

impl RegionStore for FsStore {
    fn exists(&self, world: WorldId, region: RegionPos) -> bool {
        self.region_path(world, region).is_file()
    }

    fn load(&mut self, world: WorldId, region: RegionPos) -> Result<Option<RegionState>, StoreError> {
        let path = self.region_path(world, region);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_region(&bytes).map(Some)
    }

    fn save(&mut self, world: WorldId, region: RegionPos, state: &RegionState) -> Result<(), StoreError> {
        let path = self.region_path(world, region);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = encode_region(state)?;
        // Atomic replace.
        let tmp = path.with_extension("region.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!(path = %path.display(), "region saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

type StoreKey = (WorldId, i32, i32, i32);

fn store_key(world: WorldId, region: RegionPos) -> StoreKey {
    (world, region.x, region.y, region.z)
}

/// In-memory store with call counters and failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    regions: FxHashMap<StoreKey, RegionState>,
    failing_loads: FxHashSet<StoreKey>,
    fail_saves: bool,
    loads: usize,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a saved region.
    pub fn insert(&mut self, world: WorldId, region: RegionPos, state: RegionState) {
        self.regions.insert(store_key(world, region), state);
    }

    pub fn get(&self, world: WorldId, region: RegionPos) -> Option<&RegionState> {
        self.regions.get(&store_key(world, region))
    }

    /// Makes loads of `region` fail until [`MemoryStore::heal_load`].
    pub fn fail_load(&mut self, world: WorldId, region: RegionPos) {
        self.failing_loads.insert(store_key(world, region));
    }

    pub fn heal_load(&mut self, world: WorldId, region: RegionPos) {
        self.failing_loads.remove(&store_key(world, region));
    }

    pub fn set_fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }

    /// Number of `load` calls so far.
    pub fn load_count(&self) -> usize {
        self.loads
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl RegionStore for MemoryStore {
    fn exists(&self, world: WorldId, region: RegionPos) -> bool {
        let key = store_key(world, region);
        self.regions.contains_key(&key) || self.failing_loads.contains(&key)
    }

    fn load(&mut self, world: WorldId, region: RegionPos) -> Result<Option<RegionState>, StoreError> {
        self.loads += 1;
        let key = store_key(world, region);
        if self.failing_loads.contains(&key) {
            return Err(StoreError::Corrupt(format!("injected load failure for {region}")));
        }
        Ok(self.regions.get(&key).cloned())
    }

    fn save(&mut self, world: WorldId, region: RegionPos, state: &RegionState) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io(std::io::Error::other("injected save failure")));
        }
        self.saves += 1;
        self.regions.insert(store_key(world, region), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DVec3, IVec3};

    fn sample_state() -> RegionState {
        RegionState {
            chunks: vec![(ChunkIndex::from_raw(3).unwrap(), Chunk::filled(12))],
            entities: vec![Entity::new(4, WorldId(2), DVec3::new(70.0, 5.0, -3.0))],
        }
    }

    #[test]
    fn test_fs_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStore::new(dir.path());
        let pos = IVec3::new(1, 0, -1);

        assert!(!store.exists(WorldId(2), pos));
        assert!(store.load(WorldId(2), pos).unwrap().is_none());

        store.save(WorldId(2), pos, &sample_state()).unwrap();
        assert!(store.exists(WorldId(2), pos));
        assert!(dir.path().join("2").join("1_0_-1.region").is_file());
        assert_eq!(store.load(WorldId(2), pos).unwrap(), Some(sample_state()));
    }

    #[test]
    fn test_fs_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStore::new(dir.path());
        let world_dir = dir.path().join("0");
        std::fs::create_dir_all(&world_dir).unwrap();
        std::fs::write(world_dir.join("0_0_0.region"), [10, 0, 0, 0, 0xff]).unwrap();

        assert!(store.load(WorldId(0), IVec3::ZERO).is_err());
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let mut store = MemoryStore::new();
        store.fail_load(WorldId(1), IVec3::ZERO);
        assert!(store.load(WorldId(1), IVec3::ZERO).is_err());
        store.heal_load(WorldId(1), IVec3::ZERO);
        assert!(store.load(WorldId(1), IVec3::ZERO).unwrap().is_none());
        assert_eq!(store.load_count(), 2);

        store.set_fail_saves(true);
        assert!(store.save(WorldId(1), IVec3::ZERO, &sample_state()).is_err());
        assert_eq!(store.save_count(), 0);
    }
}
