//! LRU node cache for batch traversals.
//!
//! Batch tools usually make one full pass, so the cache mostly streams;
//! it pays off for neighbourhood queries that revisit nearby leaves.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::octree::NodeId;
use crate::types::{LidarPoint, Normal};

/// Resident data of one node.
#[derive(Clone, Debug)]
pub struct CachedNode {
  pub points: Arc<[LidarPoint]>,
  pub normals: Option<Arc<[Normal]>>,
}

#[derive(Debug)]
pub struct NodeCache {
  entries: LruCache<NodeId, CachedNode>,
}

impl NodeCache {
  /// Cache sized for `budget_bytes` of nodes holding up to `max_points_per_node`.
  pub fn with_budget(budget_bytes: usize, max_points_per_node: u32) -> Self {
    let node_bytes = (max_points_per_node.max(1) as usize) * std::mem::size_of::<LidarPoint>();
    let capacity = NonZeroUsize::new(budget_bytes / node_bytes).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: LruCache::new(capacity),
    }
  }

  /// Look up a node and mark it most recently used.
  pub fn get(&mut self, id: NodeId) -> Option<&CachedNode> {
    self.entries.get(&id)
  }

  /// Insert or replace a node, evicting the least recently used one when full.
  pub fn insert(&mut self, id: NodeId, node: CachedNode) {
    self.entries.put(id, node);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.entries.cap().get()
  }
}
