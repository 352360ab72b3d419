//! Key redirection for entities that changed address mid-tick.
//!
//! After a migration rebinds an entity's compact id from its old key to its
//! new one, later events in the same tick may still name the old key.
//! Lookups go through [`RedirectTable::resolve`], a union-find with path
//! compression. The table is cleared when the tick's records are flushed.

use std::hash::Hash;

use rustc_hash::FxHashMap;

#[derive(Debug, Clone)]
pub struct RedirectTable<K> {
    parent: FxHashMap<K, K>,
}

impl<K> Default for RedirectTable<K> {
    fn default() -> Self {
        Self {
            parent: FxHashMap::default(),
        }
    }
}

impl<K: Copy + Eq + Hash> RedirectTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current address of `key`.
    pub fn resolve(&mut self, key: K) -> K {
        let mut root = key;
        while let Some(&next) = self.parent.get(&root) {
            root = next;
        }
        let mut cur = key;
        while let Some(&next) = self.parent.get(&cur) {
            if next != root {
                self.parent.insert(cur, root);
            }
            cur = next;
        }
        root
    }

    /// Records that whatever `from` resolves to now lives at `to`.
    pub fn redirect(&mut self, from: K, to: K) {
        let a = self.resolve(from);
        let b = self.resolve(to);
        if a != b {
            self.parent.insert(a, b);
        }
    }

    pub fn clear(&mut self) {
        self.parent.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}
