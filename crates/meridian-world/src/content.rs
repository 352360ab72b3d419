//! Content definitions and their dependency graph.
//!
//! Every resource a client may be told about is named by a [`ResourceRef`]:
//! a category plus a server-side id. Definitions can pull in further
//! resources (a voxel type references textures, an entity type references a
//! model and sounds), and [`ContentDefinitions`] resolves that closure.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Server-side resource identifier, unique within its category.
pub type ResourceId = u32;

/// Category of a referenced resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    World,
    Voxel,
    Node,
    EntityDef,
    Texture,
    Model,
    Sound,
}

impl ResourceKind {
    /// Number of categories.
    pub const COUNT: usize = 7;

    /// Every category, in declaration order.
    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::World,
        ResourceKind::Voxel,
        ResourceKind::Node,
        ResourceKind::EntityDef,
        ResourceKind::Texture,
        ResourceKind::Model,
        ResourceKind::Sound,
    ];

    /// Dense index for per-category tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A categorized server-side resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: ResourceId) -> Self {
        Self { kind, id }
    }
}

/// Source of definition dependencies.
pub trait ContentDefinitions {
    /// Every resource `def` transitively depends on, excluding `def` itself,
    /// sorted and without duplicates.
    fn dependencies(&self, def: ResourceRef) -> Vec<ResourceRef>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory dependency graph between definitions.
#[derive(Debug, Clone, Default)]
pub struct ContentRegistry {
    direct: FxHashMap<ResourceRef, Vec<ResourceRef>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the direct dependencies of `def`, replacing earlier ones.
    pub fn define(&mut self, def: ResourceRef, deps: impl IntoIterator<Item = ResourceRef>) {
        self.direct.insert(def, deps.into_iter().collect());
    }

    /// Number of definitions with declared dependencies.
    pub fn len(&self) -> usize {
        self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty()
    }
}

impl ContentDefinitions for ContentRegistry {
    fn dependencies(&self, def: ResourceRef) -> Vec<ResourceRef> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![def];
        while let Some(current) = stack.pop() {
            let Some(deps) = self.direct.get(&current) else {
                continue;
            };
            for &dep in deps {
                if dep != def && seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        let mut out: Vec<_> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }
}
