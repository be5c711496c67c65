//! Read-only batch traversal of a finished dataset.
//!
//! [`ProcessOctree`] loads the index skeleton eagerly and reads point blocks
//! on demand through a bounded LRU cache. All methods take `&self`, so one
//! instance can serve a worker pool (the normal calculator queries
//! neighbourhoods from many threads at once).
//!
//! Any I/O error aborts the traversal that hit it; there is no resume.

pub mod cache;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use glam::DVec3;

use self::cache::{CachedNode, NodeCache};
use crate::dataset::{self, DatasetPaths, NormalsReader, PointReader, Skeleton};
use crate::error::{OctreeError, Result};
use crate::octree::{Cube, DAabb3, NodeId, OctreeNode};
use crate::types::{LidarPoint, Normal, PointFormat};

/// Traversal counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessStats {
  /// Node blocks read from disk.
  pub nodes_loaded: u64,
  /// Node requests served from the cache.
  pub cache_hits: u64,
}

/// A point found by a neighbourhood query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
  pub point: LidarPoint,
  pub distance_squared: f64,
}

#[derive(Debug)]
pub struct ProcessOctree {
  paths: DatasetPaths,
  skeleton: Skeleton,
  offset: DVec3,
  points: Mutex<PointReader>,
  normals: Option<Mutex<NormalsReader>>,
  cache: Mutex<NodeCache>,
  nodes_loaded: AtomicU64,
  cache_hits: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  // A panicking visitor cannot leave the reader or cache half-updated.
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessOctree {
  /// Open a dataset directory with a node cache of `memory_cache_bytes`.
  pub fn open(dir: impl AsRef<Path>, memory_cache_bytes: usize) -> Result<Self> {
    let paths = DatasetPaths::new(dir.as_ref());
    let skeleton = Skeleton::load(&paths)?;
    let offset = dataset::read_offset(&paths)?;
    let points = PointReader::open(&paths, skeleton.point_format())?;
    let normals = match paths.has_normals() {
      true => Some(Mutex::new(NormalsReader::open(&paths, skeleton.num_point_records())?)),
      false => None,
    };
    let cache = NodeCache::with_budget(memory_cache_bytes, skeleton.max_points_per_node());
    tracing::info!(
      nodes = skeleton.len(),
      points = skeleton.num_leaf_points(),
      cache_nodes = cache.capacity(),
      normals = normals.is_some(),
      "opened dataset {}",
      paths.root().display()
    );
    Ok(Self {
      paths,
      skeleton,
      offset,
      points: Mutex::new(points),
      normals,
      cache: Mutex::new(cache),
      nodes_loaded: AtomicU64::new(0),
      cache_hits: AtomicU64::new(0),
    })
  }

  // ===========================================================================
  // Accessors
  // ===========================================================================

  pub fn paths(&self) -> &DatasetPaths {
    &self.paths
  }

  pub fn skeleton(&self) -> &Skeleton {
    &self.skeleton
  }

  /// Offset to add to stored positions to recover input coordinates.
  pub fn offset(&self) -> DVec3 {
    self.offset
  }

  pub fn domain(&self) -> Cube {
    self.skeleton.domain()
  }

  pub fn point_format(&self) -> PointFormat {
    self.skeleton.point_format()
  }

  pub fn max_points_per_node(&self) -> u32 {
    self.skeleton.max_points_per_node()
  }

  pub fn num_nodes(&self) -> usize {
    self.skeleton.len()
  }

  /// Distinct points in the dataset (sum over leaves).
  pub fn num_points(&self) -> u64 {
    self.skeleton.num_leaf_points()
  }

  pub fn has_normals(&self) -> bool {
    self.normals.is_some()
  }

  #[inline]
  pub fn node(&self, id: NodeId) -> &OctreeNode {
    self.skeleton.node(id)
  }

  pub fn stats(&self) -> ProcessStats {
    ProcessStats {
      nodes_loaded: self.nodes_loaded.load(Ordering::Relaxed),
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
    }
  }

  // ===========================================================================
  // Node data
  // ===========================================================================

  /// Points stored at `id`.
  pub fn node_points(&self, id: NodeId) -> Result<Arc<[LidarPoint]>> {
    if let Some(cached) = lock(&self.cache).get(id) {
      self.cache_hits.fetch_add(1, Ordering::Relaxed);
      return Ok(Arc::clone(&cached.points));
    }
    let points: Arc<[LidarPoint]> = lock(&self.points).read_node(id, self.node(id))?.into();
    self.nodes_loaded.fetch_add(1, Ordering::Relaxed);
    lock(&self.cache).insert(
      id,
      CachedNode {
        points: Arc::clone(&points),
        normals: None,
      },
    );
    Ok(points)
  }

  /// Normals of the points stored at `id`.
  pub fn node_normals(&self, id: NodeId) -> Result<Arc<[Normal]>> {
    let Some(reader) = &self.normals else {
      return Err(OctreeError::MissingNormals(self.paths.root().to_path_buf()));
    };
    if let Some(normals) = lock(&self.cache).get(id).and_then(|cached| cached.normals.clone()) {
      self.cache_hits.fetch_add(1, Ordering::Relaxed);
      return Ok(normals);
    }
    let normals: Arc<[Normal]> = lock(reader).read_node(id, self.node(id))?.into();
    let points = self.node_points(id)?;
    lock(&self.cache).insert(
      id,
      CachedNode {
        points,
        normals: Some(Arc::clone(&normals)),
      },
    );
    Ok(normals)
  }

  // ===========================================================================
  // Node traversals
  // ===========================================================================

  /// Visit every node, parent before children.
  pub fn process_nodes_prefix<F>(&self, mut visit: F) -> Result<()>
  where
    F: FnMut(NodeId, &OctreeNode, &[LidarPoint]) -> Result<()>,
  {
    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
      let node = self.node(id);
      visit(id, node, &self.node_points(id)?)?;
      if let Some(children) = node.children() {
        stack.extend(children.into_iter().rev());
      }
    }
    Ok(())
  }

  /// Visit every node level by level, coarsest first.
  pub fn process_nodes_breadth_first<F>(&self, mut visit: F) -> Result<()>
  where
    F: FnMut(NodeId, &OctreeNode, &[LidarPoint]) -> Result<()>,
  {
    let mut queue = VecDeque::from([NodeId::ROOT]);
    while let Some(id) = queue.pop_front() {
      let node = self.node(id);
      visit(id, node, &self.node_points(id)?)?;
      if let Some(children) = node.children() {
        queue.extend(children);
      }
    }
    Ok(())
  }

  /// Visit every node, children before parent.
  pub fn process_nodes_postfix<F>(&self, mut visit: F) -> Result<()>
  where
    F: FnMut(NodeId, &OctreeNode, &[LidarPoint]) -> Result<()>,
  {
    self.postfix(NodeId::ROOT, &mut visit)
  }

  fn postfix<F>(&self, id: NodeId, visit: &mut F) -> Result<()>
  where
    F: FnMut(NodeId, &OctreeNode, &[LidarPoint]) -> Result<()>,
  {
    let node = self.node(id);
    if let Some(children) = node.children() {
      for child in children {
        self.postfix(child, visit)?;
      }
    }
    visit(id, node, &self.node_points(id)?)
  }

  // ===========================================================================
  // Point traversals (leaves only: every input point exactly once)
  // ===========================================================================

  /// Depth-first walk over non-empty leaves, skipping subtrees `prune` rejects.
  fn for_each_leaf<P, V>(&self, mut prune: P, mut visit: V) -> Result<()>
  where
    P: FnMut(&OctreeNode) -> bool,
    V: FnMut(NodeId, &OctreeNode) -> Result<()>,
  {
    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
      let node = self.node(id);
      if prune(node) {
        continue;
      }
      match node.children() {
        Some(children) => stack.extend(children.into_iter().rev()),
        None if node.num_points > 0 => visit(id, node)?,
        None => {}
      }
    }
    Ok(())
  }

  /// Call `visit` for every point. Returns the number of points visited.
  pub fn process_points<F>(&self, mut visit: F) -> Result<u64>
  where
    F: FnMut(&LidarPoint),
  {
    let mut count = 0;
    self.for_each_leaf(
      |_| false,
      |id, _| {
        let points = self.node_points(id)?;
        points.iter().for_each(&mut visit);
        count += points.len() as u64;
        Ok(())
      },
    )?;
    Ok(count)
  }

  /// Call `visit` for every point inside `bounds` (closed). Leaves whose
  /// domain misses the box are never read.
  pub fn process_points_in_box<F>(&self, bounds: &DAabb3, mut visit: F) -> Result<u64>
  where
    F: FnMut(&LidarPoint),
  {
    let mut count = 0;
    self.for_each_leaf(
      |node| !node.domain.overlaps_aabb(bounds),
      |id, _| {
        for point in self.node_points(id)?.iter() {
          if bounds.contains_point(point.position) {
            visit(point);
            count += 1;
          }
        }
        Ok(())
      },
    )?;
    Ok(count)
  }

  /// Call `visit` for every point within `radius` of `center`.
  pub fn process_points_in_sphere<F>(&self, center: DVec3, radius: f64, mut visit: F) -> Result<u64>
  where
    F: FnMut(&LidarPoint),
  {
    let radius_squared = radius * radius;
    let mut count = 0;
    self.for_each_leaf(
      |node| !node.domain.intersects_sphere(center, radius),
      |id, _| {
        for point in self.node_points(id)?.iter() {
          if point.position.distance_squared(center) <= radius_squared {
            visit(point);
            count += 1;
          }
        }
        Ok(())
      },
    )?;
    Ok(count)
  }

  /// Call `visit` for every point together with its normal.
  pub fn process_points_with_normals<F>(&self, mut visit: F) -> Result<u64>
  where
    F: FnMut(&LidarPoint, Normal),
  {
    if self.normals.is_none() {
      return Err(OctreeError::MissingNormals(self.paths.root().to_path_buf()));
    }
    let mut count = 0;
    self.for_each_leaf(
      |_| false,
      |id, _| {
        let points = self.node_points(id)?;
        let normals = self.node_normals(id)?;
        for (point, normal) in points.iter().zip(normals.iter()) {
          visit(point, *normal);
        }
        count += points.len() as u64;
        Ok(())
      },
    )?;
    Ok(count)
  }

  // ===========================================================================
  // Nearest neighbours
  // ===========================================================================

  /// Up to `k` points closest to `query` within `max_radius`, nearest first.
  pub fn nearest_points(&self, query: DVec3, k: usize, max_radius: f64) -> Result<Vec<Neighbor>> {
    if k == 0 {
      return Ok(Vec::new());
    }
    let max_squared = max_radius * max_radius;
    let mut best: BinaryHeap<ByDistance<Neighbor>> = BinaryHeap::with_capacity(k + 1);
    let mut frontier = BinaryHeap::new();
    frontier.push(std::cmp::Reverse(ByDistance(
      self.domain().distance_squared(query),
      NodeId::ROOT,
    )));

    while let Some(std::cmp::Reverse(ByDistance(distance, id))) = frontier.pop() {
      let bound = match best.peek() {
        Some(worst) if best.len() == k => worst.0.min(max_squared),
        _ => max_squared,
      };
      if distance > bound {
        break;
      }
      let node = self.node(id);
      if let Some(children) = node.children() {
        for child in children {
          let domain = self.node(child).domain;
          frontier.push(std::cmp::Reverse(ByDistance(domain.distance_squared(query), child)));
        }
        continue;
      }
      if node.num_points == 0 {
        continue;
      }
      for point in self.node_points(id)?.iter() {
        let distance_squared = point.position.distance_squared(query);
        if distance_squared > max_squared {
          continue;
        }
        if best.len() < k {
          best.push(ByDistance(distance_squared, Neighbor { point: *point, distance_squared }));
        } else if best.peek().is_some_and(|worst| distance_squared < worst.0) {
          best.pop();
          best.push(ByDistance(distance_squared, Neighbor { point: *point, distance_squared }));
        }
      }
    }

    let mut neighbors: Vec<Neighbor> = best.into_iter().map(|entry| entry.1).collect();
    neighbors.sort_by(|a, b| a.distance_squared.total_cmp(&b.distance_squared));
    Ok(neighbors)
  }
}

/// Heap entry ordered by its distance key only.
#[derive(Clone, Copy, Debug)]
struct ByDistance<T>(f64, T);

impl<T> PartialEq for ByDistance<T> {
  fn eq(&self, other: &Self) -> bool {
    self.0.total_cmp(&other.0) == CmpOrdering::Equal
  }
}

impl<T> Eq for ByDistance<T> {}

impl<T> PartialOrd for ByDistance<T> {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for ByDistance<T> {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.0.total_cmp(&other.0)
  }
}

#[cfg(test)]
#[path = "process_test.rs"]
mod process_test;
