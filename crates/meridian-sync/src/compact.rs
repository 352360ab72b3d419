//! Session-local compact id allocation.
//!
//! Compact ids are small dense integers a session uses in place of server-side
//! identifiers. The reverse table is split into fixed-size blocks that are
//! created on first use. Ids released during a tick stay quarantined until
//! [`CompactIdAllocator::commit_released`], which the session calls after its
//! outgoing records are flushed, so a client never sees one id name two
//! things within one batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BLOCK_LEN: usize = 256;

/// Session-local substitute for a server-side identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompactId(pub u32);

/// Every id below the limit is in use or quarantined.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("compact id space exhausted")]
pub struct Exhausted;

/// Dense id allocator with a chunked reverse table.
#[derive(Debug, Clone)]
pub struct CompactIdAllocator<K> {
    blocks: Vec<Option<Box<[Option<K>]>>>,
    high_water: u32,
    free: Vec<u32>,
    released: Vec<u32>,
    live: usize,
    limit: u32,
}

impl<K: Copy> CompactIdAllocator<K> {
    /// Allocator handing out ids in `0..limit`.
    pub fn new(limit: u32) -> Self {
        Self {
            blocks: Vec::new(),
            high_water: 0,
            free: Vec::new(),
            released: Vec::new(),
            live: 0,
            limit,
        }
    }

    /// Binds `key` to a vacant id. Reuses committed ids before growing.
    pub fn allocate(&mut self, key: K) -> Result<CompactId, Exhausted> {
        let raw = match self.free.pop() {
            Some(raw) => raw,
            None if self.high_water < self.limit => {
                self.high_water += 1;
                self.high_water - 1
            }
            None => return Err(Exhausted),
        };
        *self.cell_mut(raw) = Some(key);
        self.live += 1;
        Ok(CompactId(raw))
    }

    /// Unbinds an id. It becomes reusable after the next commit.
    pub fn release(&mut self, id: CompactId) -> Option<K> {
        let key = self.cell(id.0).and_then(|c| *c)?;
        *self.cell_mut(id.0) = None;
        self.released.push(id.0);
        self.live -= 1;
        Some(key)
    }

    /// Key bound to `id`.
    pub fn get(&self, id: CompactId) -> Option<K> {
        self.cell(id.0).and_then(|c| *c)
    }

    /// Points an already bound id at a different key. Returns the old key.
    pub fn rebind(&mut self, id: CompactId, key: K) -> Option<K> {
        let old = self.get(id)?;
        *self.cell_mut(id.0) = Some(key);
        Some(old)
    }

    /// Makes ids released since the last commit allocatable again.
    pub fn commit_released(&mut self) {
        self.free.append(&mut self.released);
        // Pop order: lowest id first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Bound ids.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Ids released and not yet committed.
    pub fn quarantined(&self) -> usize {
        self.released.len()
    }

    /// Number of reverse-table blocks materialized so far.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    fn cell(&self, raw: u32) -> Option<&Option<K>> {
        let raw = raw as usize;
        let block = self.blocks.get(raw / BLOCK_LEN)?.as_ref()?;
        block.get(raw % BLOCK_LEN)
    }

    fn cell_mut(&mut self, raw: u32) -> &mut Option<K> {
        let raw = raw as usize;
        let index = raw / BLOCK_LEN;
        if self.blocks.len() <= index {
            self.blocks.resize_with(index + 1, || None);
        }
        let block = self.blocks[index].get_or_insert_with(|| vec![None; BLOCK_LEN].into_boxed_slice());
        &mut block[raw % BLOCK_LEN]
    }
}
