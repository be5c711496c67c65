//! Finished-dataset node: the in-memory form of one `Index` record.
//!
//! Node ids are dense indices into the skeleton's node array. The 8
//! children of an interior node always occupy consecutive ids, in octant
//! order, so `first_child + octant` addresses any child.

use std::fmt;

use super::bounds::Cube;

/// Stable identifier of a node within one opened dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u32);

impl NodeId {
  /// The root is always the first record after the index header.
  pub const ROOT: Self = Self(0);

  #[inline]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// One node of a finished octree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OctreeNode {
  /// Cubic spatial domain.
  pub domain: Cube,
  /// Characteristic point spacing; strictly smaller than the parent's.
  pub detail_size: f64,
  /// Offset of the first point record, in records.
  pub data_offset: u64,
  /// Points stored directly at this node.
  pub num_points: u32,
  /// Depth below the root (root = 0).
  pub level: u32,
  pub parent: Option<NodeId>,
  /// First of 8 consecutive children, `None` for leaves.
  pub first_child: Option<NodeId>,
}

impl OctreeNode {
  #[inline]
  pub fn is_leaf(&self) -> bool {
    self.first_child.is_none()
  }

  /// Child in `octant` (0-7), `None` for leaves.
  #[inline]
  pub fn child(&self, octant: usize) -> Option<NodeId> {
    debug_assert!(octant < 8);
    self
      .first_child
      .map(|first| NodeId(first.0 + octant as u32))
  }

  /// All 8 children in octant order, `None` for leaves.
  #[inline]
  pub fn children(&self) -> Option<[NodeId; 8]> {
    self
      .first_child
      .map(|first| std::array::from_fn(|octant| NodeId(first.0 + octant as u32)))
  }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
