//! Final bottom-up build.
//!
//! Walks the temporary octree post-order. Leaves keep their points (temp
//! leaves above the final cap are subdivided in memory first). Interior
//! nodes store a stride subsample of the concatenated point sets of their 8
//! children, so every stored point is a real input point.
//!
//! ```text
//!        worker pool (fork-join per interior node)
//!   ┌──────────┬──────────┬─────────┐
//!   child 0    child 1    ...       child 7      ── join ──► subsample ──► block
//!      │          │                    │                                   │
//!      └──────────┴────── blocks ──────┴─────► channel ──► writer thread ──┘
//!                                                           (temp block file)
//! ```
//!
//! A node's block is sent only after all of its children's blocks, so
//! parent data never precedes finished child data. [`BuiltOctree::write`]
//! then copies the blocks into `Points` in depth-first order (siblings and
//! their subtrees stay contiguous) and writes `Index` last.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use glam::DVec3;
use rayon::prelude::*;
use tempfile::NamedTempFile;

use crate::accumulator::Accumulated;
use crate::codec::{self, IndexHeader, NodeRecord};
use crate::constants::{INDEX_HEADER_SIZE, MAX_TREE_DEPTH, NODE_RECORD_SIZE};
use crate::dataset::{self, DatasetPaths};
use crate::error::{OctreeError, Result};
use crate::octree::{BuildConfig, Cube};
use crate::temp_octree::{TempNodeId, TempOctree};
use crate::threading::WorkerPool;
use crate::types::{LidarPoint, PointFormat};

/// Characteristic spacing of `count` points spread over `domain`.
#[inline]
pub fn point_spacing(domain: &Cube, count: usize) -> f64 {
  if count == 0 {
    0.0
  } else {
    domain.diameter() / (count as f64).cbrt()
  }
}

/// Summary of a written dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DatasetSummary {
  pub num_nodes: usize,
  pub num_leaves: usize,
  pub depth: u32,
  /// Distinct input points (sum over leaves).
  pub num_points: u64,
  /// Records in `Points`, leaves and subsamples together.
  pub num_records: u64,
  pub domain: Option<Cube>,
}

/// Node of the built tree, before it is written.
#[derive(Debug)]
struct BuiltNode {
  domain: Cube,
  detail_size: f64,
  num_points: u32,
  block: Option<usize>,
  children: Option<Vec<BuiltNode>>,
}

/// A built node together with the points it stores.
struct Built {
  node: BuiltNode,
  points: Vec<LidarPoint>,
}

struct Block {
  id: usize,
  points: Vec<LidarPoint>,
}

/// Output of [`OctreeCreator::build`]: the tree shape plus a temporary file
/// holding every node's block.
#[derive(Debug)]
pub struct BuiltOctree {
  root: BuiltNode,
  block_file: NamedTempFile,
  block_offsets: Vec<u64>,
  format: PointFormat,
  max_points_per_node: u32,
}

/// Runs the final pass on a [`WorkerPool`].
#[derive(Debug)]
pub struct OctreeCreator {
  config: BuildConfig,
  pool: WorkerPool,
}

impl OctreeCreator {
  pub fn new(config: BuildConfig) -> Result<Self> {
    config.validate()?;
    let pool = WorkerPool::new(config.num_threads)?;
    Ok(Self { config, pool })
  }

  pub fn config(&self) -> &BuildConfig {
    &self.config
  }

  /// Build and write a dataset from an accumulation pass.
  pub fn create(&self, accumulated: Accumulated, output_dir: &Path) -> Result<DatasetSummary> {
    let built = self.build(&accumulated.temp_octree)?;
    drop(accumulated.temp_octree);
    built.write(output_dir, accumulated.offset)
  }

  /// Build the final tree from a finished temporary octree.
  #[tracing::instrument(skip_all, name = "creator::build")]
  pub fn build(&self, temp: &TempOctree) -> Result<BuiltOctree> {
    let Some(root) = temp.root() else {
      return Err(OctreeError::config("temporary octree is empty"));
    };
    let block_file = new_block_file(self.config.temp_dir.as_deref())?;
    let writer_file = block_file
      .as_file()
      .try_clone()
      .map_err(|e| OctreeError::build("opening block file", e))?;
    let (sender, receiver) = crossbeam_channel::bounded(self.pool.num_threads() * 4);
    let format = self.config.point_format;

    let (built, block_offsets) = std::thread::scope(|scope| {
      let writer = scope.spawn(move || write_blocks(receiver, writer_file, format));
      let context = BuildContext {
        temp,
        max_points: self.config.max_points_per_node as usize,
        min_radius: self.config.min_node_radius,
        blocks: sender,
        next_block: AtomicUsize::new(0),
      };
      let built = self.pool.install(|| context.build_temp(root, 0));
      drop(context);
      let written = writer.join().unwrap_or_else(|_| {
        Err(OctreeError::build(
          "writing point blocks",
          io::Error::other("block writer panicked"),
        ))
      });
      match (built, written) {
        (Ok(built), Ok(offsets)) => Ok((built, offsets)),
        // A dead writer makes every builder fail; its error is the real cause.
        (_, Err(err)) | (Err(err), Ok(_)) => Err(err),
      }
    })?;

    let mut root = built.node;
    clamp_detail_sizes(&mut root);
    tracing::info!(
      points = temp.num_points(),
      blocks = block_offsets.len(),
      threads = self.pool.num_threads(),
      "final octree built"
    );
    Ok(BuiltOctree {
      root,
      block_file,
      block_offsets,
      format,
      max_points_per_node: self.config.max_points_per_node,
    })
  }
}

fn new_block_file(dir: Option<&Path>) -> Result<NamedTempFile> {
  let mut builder = tempfile::Builder::new();
  builder.prefix("lidar-blocks-");
  match dir {
    Some(dir) => builder.tempfile_in(dir),
    None => builder.tempfile(),
  }
  .map_err(|e| OctreeError::build("creating block file", e))
}

/// Writer thread: appends blocks in arrival order, remembers their offsets.
fn write_blocks(receiver: Receiver<Block>, file: File, format: PointFormat) -> Result<Vec<u64>> {
  let context = "writing point blocks";
  let mut writer = BufWriter::new(file);
  let mut offsets = Vec::new();
  let mut position = 0u64;
  let mut bytes = Vec::new();
  for block in receiver {
    if offsets.len() <= block.id {
      offsets.resize(block.id + 1, u64::MAX);
    }
    offsets[block.id] = position;
    bytes.clear();
    codec::encode_points(&block.points, format, &mut bytes);
    writer.write_all(&bytes).map_err(|e| OctreeError::build(context, e))?;
    position += block.points.len() as u64;
  }
  writer.flush().map_err(|e| OctreeError::build(context, e))?;
  Ok(offsets)
}

// =============================================================================
// Recursive build
// =============================================================================

struct BuildContext<'a> {
  temp: &'a TempOctree,
  max_points: usize,
  min_radius: f64,
  blocks: Sender<Block>,
  next_block: AtomicUsize,
}

impl BuildContext<'_> {
  fn build_temp(&self, id: TempNodeId, level: u32) -> Result<Built> {
    let node = self.temp.node(id);
    match node.children() {
      Some(_) if level + 1 >= MAX_TREE_DEPTH => {
        let points = self.collect_temp(id)?;
        self.build_points(node.domain(), points, level)
      }
      Some(children) => {
        let built = children
          .par_iter()
          .map(|&child| self.build_temp(child, level + 1))
          .collect::<Result<Vec<_>>>()?;
        self.interior(node.domain(), built)
      }
      None => {
        let points = self.temp.read_leaf(id)?;
        self.build_points(node.domain(), points, level)
      }
    }
  }

  /// Every point below a temp node, for subtrees too deep to keep.
  fn collect_temp(&self, id: TempNodeId) -> Result<Vec<LidarPoint>> {
    let mut points = Vec::with_capacity(self.temp.node(id).num_points() as usize);
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
      match self.temp.node(id).children() {
        Some(children) => stack.extend(children),
        None => points.extend(self.temp.read_leaf(id)?),
      }
    }
    Ok(points)
  }

  /// Build a subtree from points held in memory.
  fn build_points(&self, domain: Cube, points: Vec<LidarPoint>, level: u32) -> Result<Built> {
    if points.len() <= self.max_points {
      return self.leaf(domain, points);
    }
    if domain.radius <= self.min_radius || level + 1 >= MAX_TREE_DEPTH {
      tracing::warn!(
        points = points.len(),
        center = ?domain.center,
        "node at minimum size or depth limit keeps more points than the cap"
      );
      return self.leaf(domain, points);
    }

    let mut groups: Vec<Vec<LidarPoint>> = vec![Vec::new(); 8];
    for point in points {
      groups[domain.child_index(point.position)].push(point);
    }
    let built = groups
      .into_par_iter()
      .enumerate()
      .map(|(octant, group)| self.build_points(domain.child(octant), group, level + 1))
      .collect::<Result<Vec<_>>>()?;
    self.interior(domain, built)
  }

  fn leaf(&self, domain: Cube, points: Vec<LidarPoint>) -> Result<Built> {
    let block = self.emit(&points)?;
    Ok(Built {
      node: BuiltNode {
        domain,
        detail_size: point_spacing(&domain, points.len()),
        num_points: points.len() as u32,
        block,
        children: None,
      },
      points,
    })
  }

  /// Join point: all 8 children are complete, derive the parent's subsample.
  fn interior(&self, domain: Cube, children: Vec<Built>) -> Result<Built> {
    let total: usize = children.iter().map(|child| child.points.len()).sum();
    let stride = total.div_ceil(self.max_points).max(1);
    let points: Vec<LidarPoint> = children
      .iter()
      .flat_map(|child| child.points.iter())
      .step_by(stride)
      .copied()
      .collect();
    let block = self.emit(&points)?;
    Ok(Built {
      node: BuiltNode {
        domain,
        detail_size: point_spacing(&domain, points.len()),
        num_points: points.len() as u32,
        block,
        children: Some(children.into_iter().map(|child| child.node).collect()),
      },
      points,
    })
  }

  fn emit(&self, points: &[LidarPoint]) -> Result<Option<usize>> {
    if points.is_empty() {
      return Ok(None);
    }
    let id = self.next_block.fetch_add(1, Ordering::Relaxed);
    self
      .blocks
      .send(Block {
        id,
        points: points.to_vec(),
      })
      .map_err(|_| {
        OctreeError::build(
          "writing point blocks",
          io::Error::new(io::ErrorKind::BrokenPipe, "block writer stopped"),
        )
      })?;
    Ok(Some(id))
  }
}

/// Make detail sizes strictly decrease from parent to child.
///
/// Sparse children can have a wider own spacing than their parent; they are
/// capped at half the parent's value.
fn clamp_detail_sizes(root: &mut BuiltNode) {
  let mut stack = vec![root];
  while let Some(node) = stack.pop() {
    let limit = node.detail_size * 0.5;
    if let Some(children) = &mut node.children {
      for child in children.iter_mut() {
        child.detail_size = child.detail_size.min(limit);
        stack.push(child);
      }
    }
  }
}

// =============================================================================
// Writing
// =============================================================================

impl BuiltOctree {
  pub fn domain(&self) -> Cube {
    self.root.domain
  }

  /// Write `Points`, then `Index`, then `Offset` into `output_dir`.
  ///
  /// Normals of a dataset previously written there are removed.
  #[tracing::instrument(skip_all, name = "creator::write")]
  pub fn write(&self, output_dir: &Path, offset: DVec3) -> Result<DatasetSummary> {
    fs::create_dir_all(output_dir)
      .map_err(|e| OctreeError::build(format!("creating {}", output_dir.display()), e))?;
    let paths = DatasetPaths::new(output_dir);
    dataset::remove_normals(&paths)?;

    let mut layout = Layout::default();
    layout.records.push(None);
    layout.place(&self.root, 0, 0);
    let summary = DatasetSummary {
      num_nodes: layout.records.len(),
      num_leaves: layout.num_leaves,
      depth: layout.depth,
      num_points: layout.num_leaf_points,
      num_records: layout.next_data,
      domain: Some(self.root.domain),
    };

    self.write_points(&paths, &layout.blocks)?;
    self.write_index(&paths, &layout.records)?;
    dataset::write_offset(&paths, offset)?;

    tracing::info!(
      nodes = summary.num_nodes,
      leaves = summary.num_leaves,
      depth = summary.depth,
      points = summary.num_points,
      records = summary.num_records,
      dir = %output_dir.display(),
      "dataset written"
    );
    Ok(summary)
  }

  fn write_points(&self, paths: &DatasetPaths, blocks: &[(usize, u32)]) -> Result<()> {
    let path = paths.points();
    let context = || format!("writing {}", path.display());
    let record_size = self.format.record_size() as u64;
    let mut source = self
      .block_file
      .reopen()
      .map_err(|e| OctreeError::build("reopening block file", e))?;
    let mut writer = BufWriter::new(File::create(&path).map_err(|e| OctreeError::build(context(), e))?);
    let mut buffer = Vec::new();
    for &(block, count) in blocks {
      let offset = self.block_offsets.get(block).copied().unwrap_or(u64::MAX);
      if offset == u64::MAX {
        return Err(OctreeError::build(
          "copying point blocks",
          io::Error::new(io::ErrorKind::NotFound, format!("block {block} was never written")),
        ));
      }
      buffer.resize((count as u64 * record_size) as usize, 0);
      source
        .seek(SeekFrom::Start(offset * record_size))
        .and_then(|_| source.read_exact(&mut buffer))
        .map_err(|e| OctreeError::build("copying point blocks", e))?;
      writer.write_all(&buffer).map_err(|e| OctreeError::build(context(), e))?;
    }
    writer
      .into_inner()
      .map_err(|e| OctreeError::build(context(), e.into_error()))?
      .sync_all()
      .map_err(|e| OctreeError::build(context(), e))
  }

  fn write_index(&self, paths: &DatasetPaths, records: &[Option<NodeRecord>]) -> Result<()> {
    let path = paths.index();
    let context = || format!("writing {}", path.display());
    let mut writer = BufWriter::new(File::create(&path).map_err(|e| OctreeError::build(context(), e))?);
    let header = IndexHeader {
      point_format: self.format,
      center: self.root.domain.center,
      radius: self.root.domain.radius,
      max_points_per_node: self.max_points_per_node,
    };
    header
      .write_to(&mut writer)
      .map_err(|e| OctreeError::build(context(), e))?;
    for record in records.iter().flatten() {
      record
        .write_to(&mut writer)
        .map_err(|e| OctreeError::build(context(), e))?;
    }
    writer.flush().map_err(|e| OctreeError::build(context(), e))
  }
}

/// Index slots and data order of a built tree.
#[derive(Default)]
struct Layout {
  records: Vec<Option<NodeRecord>>,
  /// `(block id, point count)` in `Points` order.
  blocks: Vec<(usize, u32)>,
  next_data: u64,
  num_leaves: usize,
  num_leaf_points: u64,
  depth: u32,
}

impl Layout {
  /// Depth-first placement: a node's data precedes its subtree's data, and
  /// its children's record block is allocated right when it is visited, so
  /// every parent record precedes its children.
  fn place(&mut self, node: &BuiltNode, slot: usize, level: u32) {
    self.depth = self.depth.max(level);
    let data_offset = self.next_data;
    self.next_data += node.num_points as u64;
    if let Some(block) = node.block {
      self.blocks.push((block, node.num_points));
    }

    let mut children_offset = 0;
    if let Some(children) = &node.children {
      let first = self.records.len();
      self.records.resize(first + 8, None);
      children_offset = INDEX_HEADER_SIZE + first as u64 * NODE_RECORD_SIZE;
      for (octant, child) in children.iter().enumerate() {
        self.place(child, first + octant, level + 1);
      }
    } else {
      self.num_leaves += 1;
      self.num_leaf_points += node.num_points as u64;
    }
    self.records[slot] = Some(NodeRecord {
      children_offset,
      detail_size: node.detail_size,
      data_offset,
      num_points: node.num_points,
    });
  }
}

#[cfg(test)]
#[path = "creator_test.rs"]
mod creator_test;
