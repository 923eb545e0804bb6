// Core types shared across the coordinator.
//
// Defines spatial coordinates (`VoxelCoord`, `Aabb`), compact identifiers for
// graphs, nodes, links and path requests, and the `GraphMask` used to select
// subsets of graphs. All plain-data types derive `Serialize`/`Deserialize` so
// they can appear in `NavConfig` files and driver output.
//
// **Critical constraint: stale references.** A `NodeRef` carries the epoch of
// the graph it was taken from. Whenever a graph's nodes are destroyed the
// epoch advances, so any `NodeRef` held across a rescan resolves to nothing
// instead of silently pointing at a different node.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Spatial types
// ---------------------------------------------------------------------------

/// A position in voxel units.
///
/// The coordinate system uses right-handed conventions:
/// - X: east  (positive) / west  (negative)
/// - Y: up    (positive) / down  (negative)
/// - Z: south (positive) / north (negative)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelCoord {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Manhattan distance between two coordinates.
    pub fn manhattan_distance(self, other: Self) -> u32 {
        ((self.x - other.x).unsigned_abs())
            + ((self.y - other.y).unsigned_abs())
            + ((self.z - other.z).unsigned_abs())
    }

    /// Squared Euclidean distance. Computed in `i64` so far-apart coordinates
    /// cannot overflow.
    pub fn distance_squared(self, other: Self) -> i64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        let dz = i64::from(self.z) - i64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }

    /// Euclidean distance.
    pub fn distance(self, other: Self) -> f32 {
        (self.distance_squared(other) as f64).sqrt() as f32
    }
}

impl fmt::Display for VoxelCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Axis-aligned bounding box with inclusive corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aabb {
    pub min: VoxelCoord,
    pub max: VoxelCoord,
}

impl Aabb {
    /// Build a box from two arbitrary corners (the order does not matter).
    pub fn from_corners(a: VoxelCoord, b: VoxelCoord) -> Self {
        Self {
            min: VoxelCoord::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: VoxelCoord::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// A degenerate box containing a single point.
    pub fn from_point(p: VoxelCoord) -> Self {
        Self { min: p, max: p }
    }

    /// Smallest box containing every point, or `None` for an empty iterator.
    pub fn enclosing(points: impl IntoIterator<Item = VoxelCoord>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::from_point(first), |b, p| b.encapsulate(p)))
    }

    /// Grow the box by `amount` voxels on every side, saturating at the
    /// coordinate range.
    pub fn expand(self, amount: i32) -> Self {
        let amount = amount.max(0);
        Self {
            min: VoxelCoord::new(
                self.min.x.saturating_sub(amount),
                self.min.y.saturating_sub(amount),
                self.min.z.saturating_sub(amount),
            ),
            max: VoxelCoord::new(
                self.max.x.saturating_add(amount),
                self.max.y.saturating_add(amount),
                self.max.z.saturating_add(amount),
            ),
        }
    }

    /// Grow the box so it contains `p`.
    pub fn encapsulate(self, p: VoxelCoord) -> Self {
        self.union(Self::from_point(p))
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: VoxelCoord::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: VoxelCoord::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    pub fn intersects(self, other: Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains(self, p: VoxelCoord) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

impl fmt::Display for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.min, self.max)
    }
}

// ---------------------------------------------------------------------------
// Compact identifiers
// ---------------------------------------------------------------------------

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

index_id!(/// Slot of a graph inside the `GraphSet`. Slots are reused after removal.
GraphIndex(u32));
index_id!(/// Identifier handed out for every submitted path request.
PathRequestId(u64));

/// Reference to a node in a specific generation of a graph.
///
/// `epoch` must match the graph's current epoch for the reference to resolve;
/// see `GraphSet::node()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub graph: GraphIndex,
    pub epoch: u32,
    pub index: u32,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}@{}:{}", self.index, self.graph.0, self.epoch)
    }
}

/// Stable handle to a registered off-mesh link. The generation guards against
/// a freed slot being reused by a later link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkId({}v{})", self.index, self.generation)
    }
}

/// Bit set selecting graphs by index. Every graph slot has its own bit
/// (`config::MAX_GRAPHS` is capped to the width of the set).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphMask(pub u64);

impl GraphMask {
    pub const ALL: GraphMask = GraphMask(u64::MAX);
    pub const NONE: GraphMask = GraphMask(0);

    pub fn single(graph: GraphIndex) -> Self {
        if graph.0 < u64::BITS {
            GraphMask(1 << graph.0)
        } else {
            GraphMask::NONE
        }
    }

    pub fn contains(self, graph: GraphIndex) -> bool {
        graph.0 < u64::BITS && self.0 & (1 << graph.0) != 0
    }

    pub fn with(self, graph: GraphIndex) -> Self {
        GraphMask(self.0 | Self::single(graph).0)
    }
}

impl Default for GraphMask {
    fn default() -> Self {
        GraphMask::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_coord_manhattan_distance() {
        let a = VoxelCoord::new(0, 0, 0);
        let b = VoxelCoord::new(3, 4, 5);
        assert_eq!(a.manhattan_distance(b), 12);
        assert_eq!(b.manhattan_distance(a), 12);
    }

    #[test]
    fn voxel_coord_euclidean_distance() {
        let a = VoxelCoord::new(0, 0, 0);
        let b = VoxelCoord::new(3, 4, 0);
        assert_eq!(a.distance_squared(b), 25);
        assert_eq!(a.distance(b), 5.0);
    }

    #[test]
    fn aabb_from_corners_normalizes() {
        let b = Aabb::from_corners(VoxelCoord::new(5, 0, -2), VoxelCoord::new(1, 3, 4));
        assert_eq!(b.min, VoxelCoord::new(1, 0, -2));
        assert_eq!(b.max, VoxelCoord::new(5, 3, 4));
    }

    #[test]
    fn aabb_intersection_is_inclusive() {
        let a = Aabb::from_corners(VoxelCoord::new(0, 0, 0), VoxelCoord::new(2, 2, 2));
        let touching = Aabb::from_corners(VoxelCoord::new(2, 0, 0), VoxelCoord::new(4, 2, 2));
        let apart = Aabb::from_corners(VoxelCoord::new(3, 0, 0), VoxelCoord::new(4, 2, 2));
        assert!(a.intersects(touching));
        assert!(touching.intersects(a));
        assert!(!a.intersects(apart));
    }

    #[test]
    fn aabb_enclosing_and_expand() {
        let b = Aabb::enclosing([VoxelCoord::new(1, 1, 1), VoxelCoord::new(-1, 4, 0)]).unwrap();
        assert_eq!(b.min, VoxelCoord::new(-1, 1, 0));
        assert_eq!(b.max, VoxelCoord::new(1, 4, 1));
        let e = b.expand(2);
        assert!(e.contains(VoxelCoord::new(-3, -1, -2)));
        assert!(!e.contains(VoxelCoord::new(-4, 0, 0)));
        assert!(Aabb::enclosing(std::iter::empty()).is_none());
    }

    #[test]
    fn graph_mask_membership() {
        let m = GraphMask::single(GraphIndex(3)).with(GraphIndex(5));
        assert!(m.contains(GraphIndex(3)));
        assert!(m.contains(GraphIndex(5)));
        assert!(!m.contains(GraphIndex(4)));
        assert!(!m.contains(GraphIndex(100)));
        assert!(!GraphMask::NONE.contains(GraphIndex(0)));
    }

    #[test]
    fn graph_mask_covers_every_slot() {
        let last = GraphIndex(crate::config::MAX_GRAPHS as u32 - 1);
        let m = GraphMask::single(last);
        assert!(m.contains(last));
        assert_ne!(m, GraphMask::ALL);
        assert!(!m.contains(GraphIndex(0)));
        assert!(GraphMask::ALL.contains(last));
    }

    #[test]
    fn expand_saturates_at_the_coordinate_range() {
        let b = Aabb::from_point(VoxelCoord::new(5, -5, 0)).expand(i32::MAX);
        assert_eq!(b.min, VoxelCoord::new(i32::MIN + 6, i32::MIN, -i32::MAX));
        assert_eq!(b.max, VoxelCoord::new(i32::MAX, i32::MAX - 5, i32::MAX));
        assert!(b.contains(VoxelCoord::new(-1_000_000, 42, 1_000_000)));
        assert_eq!(Aabb::from_point(VoxelCoord::new(1, 1, 1)).expand(-3).min, VoxelCoord::new(1, 1, 1));
    }

    #[test]
    fn ids_display() {
        assert_eq!(GraphIndex(2).to_string(), "GraphIndex(2)");
        let r = NodeRef {
            graph: GraphIndex(1),
            epoch: 4,
            index: 9,
        };
        assert_eq!(r.to_string(), "node 9@1:4");
    }
}
