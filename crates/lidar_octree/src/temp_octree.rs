//! First-pass spatial partitioner.
//!
//! Consumes point batches in arbitrary order and spreads them over a tree of
//! per-leaf temporary files. Only the skeleton (domain, subtree point count,
//! children) lives in memory; point data is appended to the leaf files as it
//! arrives, and a leaf whose count exceeds the cap is split by streaming its
//! file into 8 new child files.
//!
//! ```text
//!  batch ──► grow root until the batch fits
//!        ──► route each point to its leaf (boundary rule of Cube::child_index)
//!        ──► append per-leaf groups to their files
//!        ──► split leaves over the cap (unless at minimum radius or
//!            the depth limit)
//! ```
//!
//! Growing the root pushes existing leaves one level down, so a tree that
//! was split to the depth limit can end up deeper than it. The final build
//! collapses such subtrees.
//!
//! [`TempOctree::finish`] merges interior subtrees that ended up holding no
//! more than one node's worth of points back into a single leaf file.
//! Records are always stored as `f64` so the final build sees the exact
//! coordinates the accumulator produced.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::codec;
use crate::constants::{MAX_TREE_DEPTH, TEMP_SPLIT_CHUNK_POINTS};
use crate::error::{OctreeError, Result};
use crate::octree::{Cube, DAabb3};
use crate::types::{LidarPoint, PointFormat};

/// Record format of temporary node files.
const TEMP_FORMAT: PointFormat = PointFormat::F64;

/// Index of a node in the temporary tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempNodeId(pub usize);

/// Skeleton node of the temporary tree.
#[derive(Clone, Debug)]
pub struct TempNode {
  domain: Cube,
  /// Points in this node's whole subtree.
  num_points: u64,
  children: Option<[TempNodeId; 8]>,
  /// Backing file of a non-empty leaf.
  file: Option<PathBuf>,
}

impl TempNode {
  fn leaf(domain: Cube) -> Self {
    Self {
      domain,
      num_points: 0,
      children: None,
      file: None,
    }
  }

  #[inline]
  pub fn domain(&self) -> Cube {
    self.domain
  }

  #[inline]
  pub fn num_points(&self) -> u64 {
    self.num_points
  }

  #[inline]
  pub fn children(&self) -> Option<[TempNodeId; 8]> {
    self.children
  }

  #[inline]
  pub fn is_leaf(&self) -> bool {
    self.children.is_none()
  }
}

/// Temporary octree with on-disk leaves. Dropping it deletes every file.
#[derive(Debug)]
pub struct TempOctree {
  dir: TempDir,
  nodes: Vec<TempNode>,
  root: Option<TempNodeId>,
  max_points_per_node: u64,
  min_node_radius: f64,
  next_file: u64,
}

impl TempOctree {
  /// Create an empty tree whose files live in a fresh directory under
  /// `parent` (the system temp dir when `None`).
  pub fn new(parent: Option<&Path>, max_points_per_node: u32, min_node_radius: f64) -> Result<Self> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("lidar-temp-octree-");
    let dir = match parent {
      Some(parent) => builder.tempdir_in(parent),
      None => builder.tempdir(),
    }
    .map_err(|e| OctreeError::build("creating temporary octree directory", e))?;
    tracing::debug!(dir = %dir.path().display(), "created temporary octree directory");
    Ok(Self {
      dir,
      nodes: Vec::new(),
      root: None,
      max_points_per_node: max_points_per_node.max(1) as u64,
      min_node_radius,
      next_file: 0,
    })
  }

  // ===========================================================================
  // Accessors
  // ===========================================================================

  #[inline]
  pub fn root(&self) -> Option<TempNodeId> {
    self.root
  }

  #[inline]
  pub fn node(&self, id: TempNodeId) -> &TempNode {
    &self.nodes[id.0]
  }

  /// Total points inserted so far.
  #[inline]
  pub fn num_points(&self) -> u64 {
    self.root.map_or(0, |root| self.nodes[root.0].num_points)
  }

  #[inline]
  pub fn dir(&self) -> &Path {
    self.dir.path()
  }

  #[inline]
  pub fn min_node_radius(&self) -> f64 {
    self.min_node_radius
  }

  /// Root domain, `None` before the first batch.
  pub fn domain(&self) -> Option<Cube> {
    self.root.map(|root| self.nodes[root.0].domain)
  }

  /// Level of `id` below the current root.
  pub fn level(&self, id: TempNodeId) -> u32 {
    let Some(root) = self.root else {
      return 0;
    };
    // Radii halve exactly per level.
    let ratio = self.nodes[root.0].domain.radius / self.nodes[id.0].domain.radius;
    ratio.log2().round().max(0.0) as u32
  }

  /// Deepest leaf level, 0 for an empty tree.
  pub fn depth(&self) -> u32 {
    let mut depth = 0;
    let mut stack: Vec<(TempNodeId, u32)> = self.root.into_iter().map(|root| (root, 0)).collect();
    while let Some((id, level)) = stack.pop() {
      depth = depth.max(level);
      if let Some(children) = self.nodes[id.0].children {
        stack.extend(children.map(|child| (child, level + 1)));
      }
    }
    depth
  }

  /// Number of leaves reachable from the root.
  pub fn num_leaves(&self) -> usize {
    let mut count = 0;
    let mut stack: Vec<TempNodeId> = self.root.into_iter().collect();
    while let Some(id) = stack.pop() {
      match self.nodes[id.0].children {
        Some(children) => stack.extend(children),
        None => count += 1,
      }
    }
    count
  }

  // ===========================================================================
  // Insertion
  // ===========================================================================

  /// Insert a batch of points, splitting leaves as they overflow.
  #[tracing::instrument(skip_all, name = "temp_octree::insert", fields(points = points.len()))]
  pub fn insert_batch(&mut self, points: &[LidarPoint]) -> Result<()> {
    if points.is_empty() {
      return Ok(());
    }
    let mut bounds = DAabb3::EMPTY;
    for point in points {
      bounds.add_point(point.position);
    }
    if !bounds.min.is_finite() || !bounds.max.is_finite() {
      return Err(OctreeError::config("point batch contains non-finite coordinates"));
    }
    self.fit_domain(&bounds);

    let mut groups: BTreeMap<TempNodeId, Vec<LidarPoint>> = BTreeMap::new();
    for point in points {
      let leaf = self.route(point);
      groups.entry(leaf).or_default().push(*point);
    }

    let mut overflowing = Vec::new();
    for (leaf, group) in groups {
      self.append(leaf, &group)?;
      if self.should_split(leaf) {
        overflowing.push(leaf);
      }
    }
    while let Some(leaf) = overflowing.pop() {
      let children = self.split(leaf)?;
      overflowing.extend(children.into_iter().filter(|&child| self.should_split(child)));
    }
    Ok(())
  }

  /// Create or grow the root until it contains `bounds`.
  fn fit_domain(&mut self, bounds: &DAabb3) {
    let root = match self.root {
      Some(root) => root,
      None => {
        let domain = Cube::bounding(bounds, self.min_node_radius);
        self.nodes.push(TempNode::leaf(domain));
        let root = TempNodeId(self.nodes.len() - 1);
        self.root = Some(root);
        root
      }
    };
    let mut root = root;
    loop {
      let domain = self.nodes[root.0].domain;
      let target = if !domain.contains(bounds.min) {
        bounds.min
      } else if !domain.contains(bounds.max) {
        bounds.max
      } else {
        break;
      };
      let (grown, octant) = domain.grow_towards(target);
      let first = self.nodes.len();
      let children: [TempNodeId; 8] = std::array::from_fn(|i| {
        if i == octant {
          root
        } else {
          TempNodeId(first + if i < octant { i } else { i - 1 })
        }
      });
      for (i, child) in children.iter().enumerate() {
        if *child != root {
          debug_assert_eq!(child.0, self.nodes.len());
          self.nodes.push(TempNode::leaf(grown.child(i)));
        }
      }
      self.nodes.push(TempNode {
        domain: grown,
        num_points: self.nodes[root.0].num_points,
        children: Some(children),
        file: None,
      });
      root = TempNodeId(self.nodes.len() - 1);
      tracing::debug!(radius = grown.radius, "grew temporary octree root");
    }
    self.root = Some(root);
  }

  /// Descend to the leaf owning `point`, counting it on the way.
  fn route(&mut self, point: &LidarPoint) -> TempNodeId {
    let Some(mut id) = self.root else {
      unreachable!("route is only called after fit_domain");
    };
    loop {
      let node = &mut self.nodes[id.0];
      node.num_points += 1;
      match node.children {
        Some(children) => id = children[node.domain.child_index(point.position)],
        None => return id,
      }
    }
  }

  #[inline]
  fn should_split(&self, id: TempNodeId) -> bool {
    let node = &self.nodes[id.0];
    node.is_leaf()
      && node.num_points > self.max_points_per_node
      && node.domain.radius > self.min_node_radius
      && self.level(id) + 1 < MAX_TREE_DEPTH
  }

  fn new_file_path(&mut self) -> PathBuf {
    let path = self.dir.path().join(format!("node-{:08}.tmp", self.next_file));
    self.next_file += 1;
    path
  }

  /// Append `points` to a leaf's file. Counts were already updated by `route`.
  fn append(&mut self, id: TempNodeId, points: &[LidarPoint]) -> Result<()> {
    let path = match &self.nodes[id.0].file {
      Some(path) => path.clone(),
      None => {
        let path = self.new_file_path();
        self.nodes[id.0].file = Some(path.clone());
        path
      }
    };
    let mut bytes = Vec::new();
    codec::encode_points(points, TEMP_FORMAT, &mut bytes);
    OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .and_then(|mut file| file.write_all(&bytes))
      .map_err(|e| OctreeError::build(format!("appending to {}", path.display()), e))
  }

  /// Split a leaf into 8 children by streaming its file.
  fn split(&mut self, id: TempNodeId) -> Result<[TempNodeId; 8]> {
    let domain = self.nodes[id.0].domain;
    let expected = self.nodes[id.0].num_points;
    let file = self.nodes[id.0].file.take();

    let first = self.nodes.len();
    let children: [TempNodeId; 8] = std::array::from_fn(|i| TempNodeId(first + i));
    for octant in 0..8 {
      self.nodes.push(TempNode::leaf(domain.child(octant)));
    }
    self.nodes[id.0].children = Some(children);

    let Some(path) = file else {
      return Ok(children);
    };
    let record_size = TEMP_FORMAT.record_size() as u64;
    let mut reader = open_checked(&path, domain, expected * record_size)?;
    let mut remaining = expected;
    let mut buffer = Vec::new();
    let mut groups: [Vec<LidarPoint>; 8] = Default::default();
    while remaining > 0 {
      let count = remaining.min(TEMP_SPLIT_CHUNK_POINTS as u64);
      buffer.resize((count * record_size) as usize, 0);
      reader
        .read_exact(&mut buffer)
        .and_then(|_| codec::decode_points(&buffer, TEMP_FORMAT))
        .map_err(|e| corrupt_temp(domain, &path, e.to_string()))
        .map(|points| {
          for point in points {
            groups[domain.child_index(point.position)].push(point);
          }
        })?;
      for (octant, group) in groups.iter_mut().enumerate() {
        if group.is_empty() {
          continue;
        }
        let child = children[octant];
        self.nodes[child.0].num_points += group.len() as u64;
        self.append(child, group)?;
        group.clear();
      }
      remaining -= count;
    }
    drop(reader);
    fs::remove_file(&path).map_err(|e| OctreeError::build(format!("removing {}", path.display()), e))?;
    tracing::trace!(points = expected, radius = domain.radius, "split temporary node");
    Ok(children)
  }

  // ===========================================================================
  // Finishing
  // ===========================================================================

  /// Merge every interior subtree whose points fit in one node into a leaf.
  #[tracing::instrument(skip_all, name = "temp_octree::finish")]
  pub fn finish(&mut self) -> Result<()> {
    if let Some(root) = self.root {
      self.merge_small_subtrees(root)?;
    }
    tracing::info!(
      points = self.num_points(),
      leaves = self.num_leaves(),
      "temporary octree complete"
    );
    Ok(())
  }

  fn merge_small_subtrees(&mut self, id: TempNodeId) -> Result<()> {
    let Some(children) = self.nodes[id.0].children else {
      return Ok(());
    };
    if self.nodes[id.0].num_points > self.max_points_per_node {
      for child in children {
        self.merge_small_subtrees(child)?;
      }
      return Ok(());
    }

    let mut sources = Vec::new();
    let mut stack = children.to_vec();
    while let Some(node) = stack.pop() {
      match self.nodes[node.0].children {
        Some(grandchildren) => stack.extend(grandchildren),
        None => sources.extend(self.nodes[node.0].file.take()),
      }
    }
    self.nodes[id.0].children = None;
    if sources.is_empty() {
      return Ok(());
    }

    let target = self.new_file_path();
    let context = || format!("merging into {}", target.display());
    let mut writer = BufWriter::new(File::create(&target).map_err(|e| OctreeError::build(context(), e))?);
    for source in &sources {
      let mut reader = File::open(source)
        .map_err(|e| corrupt_temp(self.nodes[id.0].domain, source, e.to_string()))?;
      io::copy(&mut reader, &mut writer).map_err(|e| OctreeError::build(context(), e))?;
      fs::remove_file(source).map_err(|e| OctreeError::build(context(), e))?;
    }
    writer.flush().map_err(|e| OctreeError::build(context(), e))?;
    self.nodes[id.0].file = Some(target);
    Ok(())
  }

  // ===========================================================================
  // Reading
  // ===========================================================================

  /// Read every point of a leaf.
  ///
  /// A missing or truncated file is reported as [`OctreeError::CorruptTempNode`]
  /// with the leaf's center.
  pub fn read_leaf(&self, id: TempNodeId) -> Result<Vec<LidarPoint>> {
    let node = &self.nodes[id.0];
    debug_assert!(node.is_leaf());
    let Some(path) = &node.file else {
      if node.num_points > 0 {
        return Err(corrupt_temp(
          node.domain,
          self.dir.path(),
          format!("leaf with {} points has no file", node.num_points),
        ));
      }
      return Ok(Vec::new());
    };
    let expected_len = node.num_points * TEMP_FORMAT.record_size() as u64;
    let mut reader = open_checked(path, node.domain, expected_len)?;
    let mut bytes = Vec::with_capacity(expected_len as usize);
    reader
      .read_to_end(&mut bytes)
      .map_err(|e| corrupt_temp(node.domain, path, e.to_string()))?;
    codec::decode_points(&bytes, TEMP_FORMAT).map_err(|e| corrupt_temp(node.domain, path, e.to_string()))
  }
}

fn corrupt_temp(domain: Cube, path: &Path, reason: String) -> OctreeError {
  OctreeError::CorruptTempNode {
    center: domain.center,
    path: path.to_path_buf(),
    reason,
  }
}

/// Open a temp file and check it holds exactly `expected_len` bytes.
fn open_checked(path: &Path, domain: Cube, expected_len: u64) -> Result<BufReader<File>> {
  let file = File::open(path).map_err(|e| corrupt_temp(domain, path, e.to_string()))?;
  let len = file
    .metadata()
    .map_err(|e| corrupt_temp(domain, path, e.to_string()))?
    .len();
  if len != expected_len {
    return Err(corrupt_temp(
      domain,
      path,
      format!("holds {len} bytes, expected {expected_len}"),
    ));
  }
  Ok(BufReader::new(file))
}

#[cfg(test)]
#[path = "temp_octree_test.rs"]
mod temp_octree_test;
