//! View circles and their propagation through content bridges.
//!
//! A [`ViewCircle`] is a sphere in region units: centred on the middle of
//! region `center`, with a squared radius `range`. A session's anchor circle
//! is extended through [`ContentBridge`]s, each hop landing at the bridge's
//! far endpoint with the range left over after the distance to the near
//! endpoint and a fixed hop penalty.

use std::collections::BTreeMap;

use glam::{DVec3, IVec3};
use rustc_hash::FxHashSet;

use meridian_world::{
    CHUNKS_PER_AXIS, ChunkIndex, Entity, REGION_SIZE, RegionPos, WorldId, region_of,
};

// ---------------------------------------------------------------------------
// ViewCircle
// ---------------------------------------------------------------------------

/// A visibility sphere in one world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewCircle {
    pub world: WorldId,
    pub center: IVec3,
    /// Squared radius in region units.
    pub range: i64,
}

impl ViewCircle {
    pub fn new(world: WorldId, center: IVec3, range: i64) -> Self {
        Self { world, center, range }
    }

    /// Anchor circle for a position seen `view_distance` regions far.
    pub fn around(world: WorldId, position: DVec3, view_distance: u32) -> Self {
        let d = i64::from(view_distance);
        Self::new(world, region_of(position), d * d)
    }

    /// Squared distance between region centres.
    pub fn distance_sq(&self, point: IVec3) -> i64 {
        let d = (point - self.center).as_i64vec3();
        d.length_squared()
    }

    /// Whether a region centre lies within the circle.
    pub fn reaches(&self, point: IVec3) -> bool {
        self.distance_sq(point) <= self.range
    }

    /// Whether `other` lies entirely inside this circle.
    pub fn encloses(&self, other: &ViewCircle) -> bool {
        self.world == other.world && self.range >= self.distance_sq(other.center) + other.range
    }

    /// Whether the sphere touches the box `[min, max]`, given in region units.
    pub fn touches_box(&self, min: DVec3, max: DVec3) -> bool {
        let centre = self.center.as_dvec3() + DVec3::splat(0.5);
        let closest = centre.clamp(min, max);
        closest.distance_squared(centre) <= self.range as f64
    }
}

// ---------------------------------------------------------------------------
// Bridges
// ---------------------------------------------------------------------------

/// Visibility link between two points, possibly in different worlds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentBridge {
    pub near_world: WorldId,
    pub near: IVec3,
    pub far_world: WorldId,
    pub far: IVec3,
    /// Visibility also flows from `far` back to `near`.
    pub two_way: bool,
}

/// Handle of a registered bridge.
pub type BridgeId = u32;

/// Registered bridges, iterated in id order.
#[derive(Debug, Clone, Default)]
pub struct BridgeGraph {
    bridges: BTreeMap<BridgeId, ContentBridge>,
    next_id: BridgeId,
}

impl BridgeGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bridge under the next unused id. Ids are never reused.
    pub fn insert(&mut self, bridge: ContentBridge) -> BridgeId {
        let id = self.next_id;
        self.next_id += 1;
        self.bridges.insert(id, bridge);
        id
    }

    /// Unregisters a bridge, returning it if the id was live.
    pub fn remove(&mut self, id: BridgeId) -> Option<ContentBridge> {
        self.bridges.remove(&id)
    }

    /// Number of registered bridges.
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Whether no bridge is registered.
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Directed hops `(from_world, from, to_world, to)`, in bridge id order.
    fn hops(&self) -> impl Iterator<Item = (WorldId, IVec3, WorldId, IVec3)> + '_ {
        self.bridges.values().flat_map(|b| {
            let forward = Some((b.near_world, b.near, b.far_world, b.far));
            let backward = b.two_way.then_some((b.far_world, b.far, b.near_world, b.near));
            forward.into_iter().chain(backward)
        })
    }
}

// ---------------------------------------------------------------------------
// VisibilityPropagator
// ---------------------------------------------------------------------------

/// Expands an anchor circle into every circle reachable through bridges.
#[derive(Debug, Clone, Copy)]
pub struct VisibilityPropagator {
    /// Maximum number of hops followed.
    pub max_depth: u32,
    /// Squared range consumed by each hop on top of the travelled distance.
    pub hop_penalty: i64,
}

impl Default for VisibilityPropagator {
    fn default() -> Self {
        Self {
            max_depth: 2,
            hop_penalty: 1,
        }
    }
}

impl VisibilityPropagator {
    /// Propagator following at most `max_depth` hops, each costing `hop_penalty`.
    pub fn new(max_depth: u32, hop_penalty: i64) -> Self {
        Self {
            max_depth,
            hop_penalty,
        }
    }

    /// Anchor first, then derived circles in discovery order.
    ///
    /// A candidate already enclosed by an accepted circle is dropped, which
    /// also stops bridge cycles from re-adding the same area. An accepted
    /// candidate evicts earlier derived circles it encloses.
    pub fn propagate(&self, anchor: ViewCircle, bridges: &BridgeGraph) -> Vec<ViewCircle> {
        let mut circles = vec![anchor];
        if anchor.range > 0 {
            self.expand(anchor, self.max_depth, bridges, &mut circles);
        }
        circles
    }

    fn expand(&self, source: ViewCircle, depth: u32, bridges: &BridgeGraph, circles: &mut Vec<ViewCircle>) {
        if depth == 0 {
            return;
        }
        for (from_world, from, to_world, to) in bridges.hops() {
            if from_world != source.world || !source.reaches(from) {
                continue;
            }
            let range = source.range - source.distance_sq(from) - self.hop_penalty;
            if range <= 0 {
                continue;
            }
            let candidate = ViewCircle::new(to_world, to, range);
            if circles.iter().any(|c| c.encloses(&candidate)) {
                continue;
            }
            let anchor = circles[0];
            circles.retain(|c| *c == anchor || !candidate.encloses(c));
            circles.push(candidate);
            self.expand(candidate, depth - 1, bridges, circles);
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage queries
// ---------------------------------------------------------------------------

/// Regions touched by any circle, sorted by world then coordinate.
pub fn covered_regions(circles: &[ViewCircle]) -> Vec<(WorldId, RegionPos)> {
    let mut seen = FxHashSet::default();
    for circle in circles {
        if circle.range < 0 {
            continue;
        }
        let r = (circle.range as f64).sqrt().ceil() as i32 + 1;
        for dz in -r..=r {
            for dy in -r..=r {
                for dx in -r..=r {
                    let pos = circle.center + IVec3::new(dx, dy, dz);
                    let min = pos.as_dvec3();
                    if circle.touches_box(min, min + DVec3::ONE) {
                        seen.insert((circle.world, pos));
                    }
                }
            }
        }
    }
    let mut out: Vec<_> = seen.into_iter().collect();
    out.sort_unstable_by_key(|(w, p)| (*w, p.x, p.y, p.z));
    out
}

/// Whether any circle touches a chunk.
pub fn chunk_visible(circles: &[ViewCircle], world: WorldId, region: RegionPos, index: ChunkIndex) -> bool {
    let step = 1.0 / f64::from(CHUNKS_PER_AXIS);
    let min = region.as_dvec3() + index.local().as_dvec3() * step;
    let max = min + DVec3::splat(step);
    circles
        .iter()
        .any(|c| c.world == world && c.touches_box(min, max))
}

/// Whether any circle touches an entity's bounding box.
pub fn entity_visible(circles: &[ViewCircle], world: WorldId, entity: &Entity) -> bool {
    let (min, max) = entity.bounds();
    let scale = f64::from(REGION_SIZE);
    circles
        .iter()
        .any(|c| c.world == world && c.touches_box(min / scale, max / scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: WorldId = WorldId(1);
    const V: WorldId = WorldId(2);

    fn bridge(near_world: WorldId, near: IVec3, far_world: WorldId, far: IVec3, two_way: bool) -> ContentBridge {
        ContentBridge {
            near_world,
            near,
            far_world,
            far,
            two_way,
        }
    }

    #[test]
    fn test_no_bridges_yields_anchor_only() {
        let anchor = ViewCircle::new(W, IVec3::ZERO, 4);
        let circles = VisibilityPropagator::default().propagate(anchor, &BridgeGraph::new());
        assert_eq!(circles, vec![anchor]);
    }

    #[test]
    fn test_bridge_hop_spends_distance_and_penalty() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::new(1, 0, 0), V, IVec3::new(100, 0, 0), false));

        let anchor = ViewCircle::new(W, IVec3::ZERO, 4);
        let circles = VisibilityPropagator::new(2, 1).propagate(anchor, &bridges);
        assert_eq!(circles, vec![anchor, ViewCircle::new(V, IVec3::new(100, 0, 0), 2)]);
    }

    #[test]
    fn test_unreached_bridge_ignored() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::new(5, 0, 0), V, IVec3::ZERO, true));
        let anchor = ViewCircle::new(W, IVec3::ZERO, 4);
        assert_eq!(VisibilityPropagator::default().propagate(anchor, &bridges).len(), 1);
    }

    #[test]
    fn test_two_way_cycle_is_pruned() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::ZERO, V, IVec3::ZERO, true));

        let anchor = ViewCircle::new(W, IVec3::ZERO, 9);
        let circles = VisibilityPropagator::new(8, 1).propagate(anchor, &bridges);
        // The hop back into W is enclosed by the anchor.
        assert_eq!(circles, vec![anchor, ViewCircle::new(V, IVec3::ZERO, 8)]);
    }

    #[test]
    fn test_larger_circle_evicts_enclosed_one() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::new(3, 0, 0), V, IVec3::ZERO, false));
        bridges.insert(bridge(W, IVec3::ZERO, V, IVec3::ZERO, false));

        let anchor = ViewCircle::new(W, IVec3::ZERO, 20);
        let circles = VisibilityPropagator::new(2, 1).propagate(anchor, &bridges);
        // The far hop yields range 10 first, then the near hop yields 19 around the same point.
        assert_eq!(circles, vec![anchor, ViewCircle::new(V, IVec3::ZERO, 19)]);
    }

    #[test]
    fn test_depth_limits_chain() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::ZERO, V, IVec3::ZERO, false));
        bridges.insert(bridge(V, IVec3::ZERO, WorldId(3), IVec3::ZERO, false));

        let anchor = ViewCircle::new(W, IVec3::ZERO, 16);
        assert_eq!(VisibilityPropagator::new(1, 1).propagate(anchor, &bridges).len(), 2);
        assert_eq!(VisibilityPropagator::new(2, 1).propagate(anchor, &bridges).len(), 3);
    }

    #[test]
    fn test_penalty_exhausts_range() {
        let mut bridges = BridgeGraph::new();
        bridges.insert(bridge(W, IVec3::new(1, 0, 0), V, IVec3::ZERO, false));
        let anchor = ViewCircle::new(W, IVec3::ZERO, 2);
        assert_eq!(VisibilityPropagator::new(2, 1).propagate(anchor, &bridges).len(), 1);
    }

    #[test]
    fn test_covered_regions_of_unit_circle() {
        let regions = covered_regions(&[ViewCircle::new(W, IVec3::ZERO, 1)]);
        assert!(regions.contains(&(W, IVec3::ZERO)));
        assert!(regions.contains(&(W, IVec3::new(1, 0, 0))));
        assert!(regions.contains(&(W, IVec3::new(-1, 0, 0))));
        // Corner neighbours are at distance sqrt(0.75) from the centre.
        assert!(regions.contains(&(W, IVec3::new(1, 1, 1))));
        assert!(!regions.contains(&(W, IVec3::new(2, 0, 0))));
    }

    #[test]
    fn test_zero_range_covers_own_region() {
        let regions = covered_regions(&[ViewCircle::new(W, IVec3::new(3, 3, 3), 0)]);
        assert_eq!(regions, vec![(W, IVec3::new(3, 3, 3))]);
    }

    #[test]
    fn test_chunk_visibility_respects_world() {
        let circles = [ViewCircle::new(W, IVec3::ZERO, 1)];
        let index = ChunkIndex::from_local(IVec3::new(3, 0, 0)).unwrap();
        assert!(!chunk_visible(&circles, W, IVec3::new(1, 0, 0), index));
        assert!(chunk_visible(&circles, W, IVec3::ZERO, index));
        assert!(!chunk_visible(&circles, V, IVec3::ZERO, index));
    }

    #[test]
    fn test_entity_visibility_uses_bounds() {
        let circles = [ViewCircle::new(W, IVec3::ZERO, 1)];
        let far = Entity::new(1, W, DVec3::new(200.0, 32.0, 32.0));
        assert!(!entity_visible(&circles, W, &far));
        let big = far.clone().with_half_extent(DVec3::new(110.0, 1.0, 1.0));
        assert!(entity_visible(&circles, W, &big));
    }
}
