//! Interactive node cache with view-dependent refinement.
//!
//! # Node lifecycle
//!
//! ```text
//!   Unloaded ──request──▶ Requested ──read──▶ Resident ──upload──▶ Uploaded
//!      ▲                      │                  │                    │
//!      │                      └── over budget ───┘                    │
//!      └──────────── evicted (whole child group) ◀────────────────────┘
//! ```
//!
//! Children are always loaded and evicted as a group of 8, so an interior
//! node either has all of its children resident or none. The root is loaded
//! when the cache opens and is never evicted; a parent's subsample is always
//! a valid stand-in for its children.
//!
//! # Frame
//!
//! [`RuntimeOctree::render_pass`] runs on the caller's thread:
//!
//! 1. traverse the resident tree, culling by frustum and refining where the
//!    projected detail exceeds the quality target; nodes it touches are
//!    stamped with the frame number, which pins them against eviction
//! 2. read requested child groups, highest projected detail first, within
//!    the load budget; memory comes from evicting groups nobody used this
//!    frame, lowest `priority / (1 + age)` first
//! 3. upload drawn nodes to the GPU within the upload budget and draw them;
//!    anything without a buffer is drawn straight from CPU memory
//!
//! Read failures never abort a frame: the group stays unloaded, the parent
//! keeps drawing its subsample and the read is retried later.
//!
//! # Selection
//!
//! Selection flags live on resident points only. Evicting a group drops its
//! flags; reloading the region does not restore them.

pub mod interact;
pub mod lod;
pub mod renderer;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use glam::DVec3;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::dataset::{read_offset, DatasetPaths, NormalsReader, PointReader, Skeleton};
use crate::error::{OctreeError, Result};
use crate::metrics::{self, CacheMetrics};
use crate::octree::{Cube, FrameStats, NodeId, RuntimeConfig};
use crate::types::{LidarPoint, Normal};

pub use interact::{Interactor, PickResult, Ray};
pub use lod::{Focus, Frustum, ViewState};
pub use renderer::{BufferId, HeadlessRenderer, PointRenderer};

/// Frames a failed child group waits before it is read again.
const RETRY_FRAMES: u64 = 60;

new_key_type! {
  struct EntryKey;
}

/// Where a node currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
  Unloaded,
  /// Wanted by the last frame but not read yet (budget, memory or retry).
  Requested,
  /// Points in the CPU cache.
  Resident,
  /// Resident with a GPU buffer.
  Uploaded,
}

#[derive(Debug)]
struct Entry {
  node: NodeId,
  points: Vec<LidarPoint>,
  normals: Option<Vec<Normal>>,
  selected: Vec<bool>,
  num_selected: usize,
  children_resident: bool,
  /// Frame that last traversed this node.
  last_used: u64,
  /// Projected detail at the last traversal.
  priority: f64,
  gpu: Option<BufferId>,
  gpu_dirty: bool,
  gpu_last_used: u64,
}

/// Budgeted CPU/GPU cache over a finished dataset.
pub struct RuntimeOctree {
  paths: DatasetPaths,
  skeleton: Skeleton,
  offset: DVec3,
  config: RuntimeConfig,
  reader: PointReader,
  normals: Option<NormalsReader>,
  entries: SlotMap<EntryKey, Entry>,
  /// Entry of every resident node, indexed by node id.
  resident: Vec<Option<EntryKey>>,
  /// Parents whose child group the last frame wanted but did not read.
  requested: HashSet<NodeId>,
  retry_after: HashMap<NodeId, u64>,
  pending_releases: Vec<BufferId>,
  memory_bytes: usize,
  gpu_bytes: usize,
  frame: u64,
  metrics: CacheMetrics,
}

impl RuntimeOctree {
  /// Open a dataset and load its root.
  ///
  /// Fails with a configuration error when the root alone does not fit the
  /// memory budget.
  pub fn open(dir: impl AsRef<Path>, config: RuntimeConfig) -> Result<Self> {
    config.validate()?;
    let paths = DatasetPaths::new(dir.as_ref());
    let skeleton = Skeleton::load(&paths)?;
    let offset = read_offset(&paths)?;
    let reader = PointReader::open(&paths, skeleton.point_format())?;
    let normals = if paths.has_normals() {
      Some(NormalsReader::open(&paths, skeleton.num_point_records())?)
    } else {
      None
    };
    let mut octree = Self {
      resident: vec![None; skeleton.len()],
      paths,
      skeleton,
      offset,
      config,
      reader,
      normals,
      entries: SlotMap::with_key(),
      requested: HashSet::new(),
      retry_after: HashMap::new(),
      pending_releases: Vec::new(),
      memory_bytes: 0,
      gpu_bytes: 0,
      frame: 0,
      metrics: CacheMetrics::new(),
    };

    let root_bytes = octree.node_bytes(NodeId::ROOT);
    if root_bytes > octree.config.memory_cache_bytes {
      return Err(OctreeError::config(format!(
        "memory cache of {} bytes cannot hold the root node ({root_bytes} bytes)",
        octree.config.memory_cache_bytes
      )));
    }
    let (points, normals) = octree.read_node(NodeId::ROOT)?;
    octree.insert_entry(NodeId::ROOT, points, normals, f64::INFINITY);
    info!(
      dataset = %octree.paths.root().display(),
      nodes = octree.skeleton.len(),
      memory_budget = octree.config.memory_cache_bytes,
      gpu_budget = octree.config.gpu_cache_bytes,
      normals = octree.normals.is_some(),
      "runtime octree opened"
    );
    Ok(octree)
  }

  pub fn paths(&self) -> &DatasetPaths {
    &self.paths
  }

  pub fn skeleton(&self) -> &Skeleton {
    &self.skeleton
  }

  /// Offset to add to dataset coordinates to recover source coordinates.
  pub fn offset(&self) -> DVec3 {
    self.offset
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  pub fn has_normals(&self) -> bool {
    self.normals.is_some()
  }

  /// Bytes held by resident nodes; never above the memory budget.
  pub fn memory_usage(&self) -> usize {
    self.memory_bytes
  }

  /// Bytes held by GPU buffers; never above the GPU budget.
  pub fn gpu_usage(&self) -> usize {
    self.gpu_bytes
  }

  pub fn num_resident(&self) -> usize {
    self.entries.len()
  }

  /// Number of render passes run so far.
  pub fn frame(&self) -> u64 {
    self.frame
  }

  pub fn metrics(&self) -> &CacheMetrics {
    &self.metrics
  }

  pub fn render_quality(&self) -> f64 {
    self.config.render_quality
  }

  /// Each step up halves the projected spacing the LOD test accepts.
  pub fn set_render_quality(&mut self, quality: f64) {
    if quality.is_finite() {
      self.config.render_quality = quality;
    }
  }

  pub fn focus_and_context(&self) -> f64 {
    self.config.focus_and_context_weight
  }

  pub fn set_focus_and_context(&mut self, weight: f64) {
    self.config.focus_and_context_weight = weight.max(0.0);
  }

  pub fn node_state(&self, id: NodeId) -> NodeState {
    if id.index() >= self.skeleton.len() {
      return NodeState::Unloaded;
    }
    match self.entry(id) {
      Some(entry) if entry.gpu.is_some() => NodeState::Uploaded,
      Some(_) => NodeState::Resident,
      None => match self.skeleton.node(id).parent {
        Some(parent) if self.requested.contains(&parent) => NodeState::Requested,
        _ => NodeState::Unloaded,
      },
    }
  }

  /// Points of a resident node.
  pub fn resident_points(&self, id: NodeId) -> Option<&[LidarPoint]> {
    self.entry(id).map(|entry| entry.points.as_slice())
  }

  /// Selection flag of one resident point.
  pub fn is_selected(&self, id: NodeId, index: usize) -> Option<bool> {
    self.entry(id)?.selected.get(index).copied()
  }

  /// Ids of every resident node, in no particular order.
  pub fn resident_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
    self.entries.values().map(|entry| entry.node)
  }

  // ===========================================================================
  // Frame
  // ===========================================================================

  /// Refine, load, upload and draw one frame.
  pub fn render_pass<R: PointRenderer>(&mut self, view: &ViewState, renderer: &mut R) -> FrameStats {
    self.frame += 1;
    let frame = self.frame;
    let _span = tracing::info_span!("runtime::render_pass", frame).entered();
    let started = metrics::start_timer();
    let mut stats = FrameStats::default();
    self.requested.clear();

    let frustum = view.frustum();
    let threshold = lod::quality_threshold(self.config.render_quality);
    let weight = self.config.focus_and_context_weight;
    let mut draws: Vec<EntryKey> = Vec::new();
    let mut requests: Vec<(f64, NodeId)> = Vec::new();

    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
      let node = *self.skeleton.node(id);
      if !frustum.intersects_cube(&node.domain) {
        stats.culled_nodes += 1;
        continue;
      }
      let Some(key) = self.resident[id.index()] else {
        continue;
      };
      let Some(entry) = self.entries.get_mut(key) else {
        continue;
      };
      let projected = lod::projected_detail(view, &node.domain, node.detail_size, weight);
      entry.last_used = frame;
      entry.priority = projected;
      if !node.is_leaf() && projected > threshold {
        if entry.children_resident {
          if let Some(children) = node.children() {
            stack.extend(children);
          }
          continue;
        }
        requests.push((projected, id));
      }
      draws.push(key);
    }

    requests.sort_by(|a, b| b.0.total_cmp(&a.0));
    stats.requested_groups = requests.len();
    for (_, id) in requests {
      let waiting = self.retry_after.get(&id).is_some_and(|&retry| retry > frame);
      if waiting || !self.config.budget.can_load(stats.total_load_attempts()) {
        self.requested.insert(id);
        continue;
      }
      self.load_group(id, &mut stats);
    }

    for buffer in self.pending_releases.drain(..) {
      renderer.release(buffer);
    }
    for key in draws {
      self.draw_entry(key, renderer, &mut stats);
    }

    self.metrics.record_frame(started, self.memory_bytes);
    debug!(
      rendered = stats.rendered_nodes,
      points = stats.rendered_points,
      loaded = stats.loaded_groups,
      evicted = stats.evicted_groups,
      deferred = stats.deferred_for_memory,
      failed = stats.failed_loads,
      memory = self.memory_bytes,
      "render pass"
    );
    stats
  }

  /// Release every GPU buffer, e.g. before the graphics context goes away.
  pub fn release_gpu<R: PointRenderer>(&mut self, renderer: &mut R) {
    for buffer in self.pending_releases.drain(..) {
      renderer.release(buffer);
    }
    for entry in self.entries.values_mut() {
      if let Some(buffer) = entry.gpu.take() {
        renderer.release(buffer);
      }
    }
    self.gpu_bytes = 0;
  }

  fn draw_entry<R: PointRenderer>(&mut self, key: EntryKey, renderer: &mut R, stats: &mut FrameStats) {
    let frame = self.frame;
    // Drawn entries were stamped this frame, so nothing evicted them.
    let Some(entry) = self.entries.get_mut(key) else {
      return;
    };
    if entry.points.is_empty() {
      return;
    }
    stats.rendered_nodes += 1;
    stats.rendered_points += entry.points.len();
    if let (Some(buffer), false) = (entry.gpu, entry.gpu_dirty) {
      entry.gpu_last_used = frame;
      renderer.draw_buffer(buffer);
      return;
    }

    let needed = entry.points.len() * self.config.gpu_bytes_per_point;
    let can_upload = self.config.budget.can_upload(stats.uploads);
    if can_upload {
      if let Some(stale) = entry.gpu.take() {
        renderer.release(stale);
        self.gpu_bytes -= needed;
      }
    }
    if can_upload && self.make_gpu_room(needed, renderer, stats) {
      if let Some(entry) = self.entries.get_mut(key) {
        let buffer = renderer.upload(entry.node, &entry.points, &entry.selected);
        entry.gpu = Some(buffer);
        entry.gpu_dirty = false;
        entry.gpu_last_used = frame;
        self.gpu_bytes += needed;
        stats.uploads += 1;
        renderer.draw_buffer(buffer);
      }
    } else if let Some(entry) = self.entries.get(key) {
      renderer.draw_points(&entry.points, &entry.selected);
      stats.immediate_draws += 1;
    }
  }

  /// Release buffers not drawn this frame, least recently drawn first.
  fn make_gpu_room<R: PointRenderer>(&mut self, needed: usize, renderer: &mut R, stats: &mut FrameStats) -> bool {
    if needed > self.config.gpu_cache_bytes {
      return false;
    }
    let per_point = self.config.gpu_bytes_per_point;
    while self.gpu_bytes + needed > self.config.gpu_cache_bytes {
      let frame = self.frame;
      let victim = self
        .entries
        .iter()
        .filter(|(_, entry)| entry.gpu.is_some() && entry.gpu_last_used < frame)
        .min_by_key(|(_, entry)| entry.gpu_last_used)
        .map(|(key, _)| key);
      let Some(entry) = victim.and_then(|key| self.entries.get_mut(key)) else {
        return false;
      };
      if let Some(buffer) = entry.gpu.take() {
        renderer.release(buffer);
        self.gpu_bytes -= entry.points.len() * per_point;
        stats.gpu_evictions += 1;
      }
    }
    true
  }

  // ===========================================================================
  // Loading and eviction
  // ===========================================================================

  fn entry(&self, id: NodeId) -> Option<&Entry> {
    let key = (*self.resident.get(id.index())?)?;
    self.entries.get(key)
  }

  fn entry_bytes(&self, num_points: usize) -> usize {
    let mut per_point = std::mem::size_of::<LidarPoint>() + std::mem::size_of::<bool>();
    if self.normals.is_some() {
      per_point += std::mem::size_of::<Normal>();
    }
    num_points * per_point
  }

  fn node_bytes(&self, id: NodeId) -> usize {
    self.entry_bytes(self.skeleton.node(id).num_points as usize)
  }

  fn read_node(&mut self, id: NodeId) -> Result<(Vec<LidarPoint>, Option<Vec<Normal>>)> {
    let node = self.skeleton.node(id);
    let points = self.reader.read_node(id, node)?;
    let normals = match self.normals.as_mut() {
      Some(reader) => Some(reader.read_node(id, node)?),
      None => None,
    };
    Ok((points, normals))
  }

  fn insert_entry(&mut self, id: NodeId, points: Vec<LidarPoint>, normals: Option<Vec<Normal>>, priority: f64) {
    self.memory_bytes += self.entry_bytes(points.len());
    let key = self.entries.insert(Entry {
      node: id,
      selected: vec![false; points.len()],
      points,
      normals,
      num_selected: 0,
      children_resident: false,
      last_used: self.frame,
      priority,
      gpu: None,
      gpu_dirty: false,
      gpu_last_used: 0,
    });
    self.resident[id.index()] = Some(key);
  }

  /// Read all children of `parent`. Returns whether the group is now resident.
  fn load_group(&mut self, parent: NodeId, stats: &mut FrameStats) -> bool {
    let Some(children) = self.skeleton.node(parent).children() else {
      return false;
    };
    let bytes: usize = children.iter().map(|&child| self.node_bytes(child)).sum();
    if bytes > self.config.memory_cache_bytes || !self.make_room(bytes, stats) {
      stats.deferred_for_memory += 1;
      self.requested.insert(parent);
      return false;
    }

    let started = metrics::start_timer();
    let mut group: SmallVec<[(NodeId, Vec<LidarPoint>, Option<Vec<Normal>>); 8]> = SmallVec::new();
    for child in children {
      match self.read_node(child) {
        Ok((points, normals)) => group.push((child, points, normals)),
        Err(err) => {
          warn!(node = %parent, child = %child, error = %err, "child group failed to load, keeping the coarser level");
          stats.failed_loads += 1;
          self.metrics.record_load_failure();
          self.retry_after.insert(parent, self.frame + RETRY_FRAMES);
          self.requested.insert(parent);
          return false;
        }
      }
    }

    let priority = self.entry(parent).map_or(0.0, |entry| entry.priority);
    let mut num_points = 0u64;
    for (child, points, normals) in group {
      num_points += points.len() as u64;
      self.insert_entry(child, points, normals, priority);
    }
    if let Some(key) = self.resident[parent.index()] {
      if let Some(entry) = self.entries.get_mut(key) {
        entry.children_resident = true;
      }
    }
    self.retry_after.remove(&parent);
    stats.loaded_groups += 1;
    self.metrics.record_load(started, num_points);
    true
  }

  /// Evict unpinned groups until `bytes` more fit the budget.
  fn make_room(&mut self, bytes: usize, stats: &mut FrameStats) -> bool {
    while self.memory_bytes + bytes > self.config.memory_cache_bytes {
      if !self.evict_one(stats) {
        return false;
      }
    }
    true
  }

  /// Evict the least valuable group without resident grandchildren.
  fn evict_one(&mut self, stats: &mut FrameStats) -> bool {
    let frame = self.frame;
    let mut best: Option<(f64, NodeId)> = None;
    for entry in self.entries.values() {
      if !entry.children_resident {
        continue;
      }
      let Some(children) = self.skeleton.node(entry.node).children() else {
        continue;
      };
      let mut newest = 0;
      let mut priority = 0.0f64;
      let evictable = children.iter().all(|&child| match self.entry(child) {
        Some(child) if !child.children_resident && child.last_used < frame => {
          newest = newest.max(child.last_used);
          priority = priority.max(child.priority);
          true
        }
        _ => false,
      });
      if !evictable {
        continue;
      }
      let score = priority / (1.0 + (frame - newest) as f64);
      if best.map_or(true, |(lowest, _)| score < lowest) {
        best = Some((score, entry.node));
      }
    }

    let Some((_, parent)) = best else {
      return false;
    };
    self.evict_children(parent);
    stats.evicted_groups += 1;
    self.metrics.record_eviction();
    true
  }

  fn evict_children(&mut self, parent: NodeId) {
    let Some(children) = self.skeleton.node(parent).children() else {
      return;
    };
    for child in children {
      let Some(key) = self.resident[child.index()].take() else {
        continue;
      };
      if let Some(entry) = self.entries.remove(key) {
        self.memory_bytes -= self.entry_bytes(entry.points.len());
        if let Some(buffer) = entry.gpu {
          self.gpu_bytes -= entry.points.len() * self.config.gpu_bytes_per_point;
          self.pending_releases.push(buffer);
        }
      }
    }
    if let Some(key) = self.resident[parent.index()] {
      if let Some(entry) = self.entries.get_mut(key) {
        entry.children_resident = false;
      }
    }
  }

  // ===========================================================================
  // Interaction
  // ===========================================================================

  /// Load child groups intersecting the interactor, toward the leaves.
  ///
  /// Call once per frame before [`Self::select_points`]. Reads count against
  /// the frame's load budget, so a large brush reaches the leaves over
  /// several frames; `requested_groups` in the result is 0 once the region
  /// is fully resident. Memory limits still apply.
  pub fn interact(&mut self, interactor: &Interactor) -> FrameStats {
    let mut stats = FrameStats::default();
    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
      let node = *self.skeleton.node(id);
      if !interactor.intersects(&node.domain) {
        continue;
      }
      let Some(key) = self.resident[id.index()] else {
        continue;
      };
      let Some(entry) = self.entries.get_mut(key) else {
        continue;
      };
      entry.last_used = self.frame;
      let Some(children) = node.children() else {
        continue;
      };
      let mut resident = entry.children_resident;
      let waiting = self.retry_after.get(&id).is_some_and(|&retry| retry > self.frame);
      if !resident && !waiting {
        stats.requested_groups += 1;
        if self.config.budget.can_load(stats.total_load_attempts()) {
          resident = self.load_group(id, &mut stats);
        }
      }
      if resident {
        stack.extend(children);
      }
    }
    stats
  }

  /// Select resident points inside the interactor. Returns how many changed.
  pub fn select_points(&mut self, interactor: &Interactor) -> usize {
    self.apply_selection(interactor, true)
  }

  /// Deselect resident points inside the interactor. Returns how many changed.
  pub fn deselect_points(&mut self, interactor: &Interactor) -> usize {
    self.apply_selection(interactor, false)
  }

  fn apply_selection(&mut self, interactor: &Interactor, select: bool) -> usize {
    let mut changed = 0;
    for entry in self.entries.values_mut() {
      if !interactor.intersects(&self.skeleton.node(entry.node).domain) {
        continue;
      }
      let mut flipped = 0;
      for (point, flag) in entry.points.iter().zip(entry.selected.iter_mut()) {
        if *flag != select && interactor.contains(point.position) {
          *flag = select;
          flipped += 1;
        }
      }
      if flipped > 0 {
        if select {
          entry.num_selected += flipped;
        } else {
          entry.num_selected -= flipped;
        }
        entry.gpu_dirty = true;
        changed += flipped;
      }
    }
    changed
  }

  /// Deselect everything. Returns how many points were selected.
  pub fn clear_selection(&mut self) -> usize {
    let mut cleared = 0;
    for entry in self.entries.values_mut() {
      if entry.num_selected > 0 {
        cleared += entry.num_selected;
        entry.selected.fill(false);
        entry.num_selected = 0;
        entry.gpu_dirty = true;
      }
    }
    cleared
  }

  /// Selected points across every resident node, coarse copies included.
  pub fn num_selected(&self) -> usize {
    self.entries.values().map(|entry| entry.num_selected).sum()
  }

  /// Visit the selected points of the finest resident level.
  ///
  /// Interior nodes whose children are resident are skipped, so a point
  /// also stored in a parent subsample is visited once.
  pub fn process_selected_points<F>(&self, mut visit: F) -> usize
  where
    F: FnMut(&LidarPoint, Option<Normal>),
  {
    let mut count = 0;
    for key in self.frontier(|_| true) {
      let entry = &self.entries[key];
      if entry.num_selected == 0 {
        continue;
      }
      for (index, point) in entry.points.iter().enumerate() {
        if entry.selected[index] {
          let normal = entry.normals.as_ref().map(|normals| normals[index]);
          visit(point, normal);
          count += 1;
        }
      }
    }
    count
  }

  /// Closest resident point to `position` within `max_distance`.
  pub fn find_nearest_point(&self, position: DVec3, max_distance: f64) -> Option<PickResult> {
    let max_squared = max_distance * max_distance;
    let mut best: Option<PickResult> = None;
    let mut best_squared = max_squared;
    for key in self.frontier(|domain| domain.distance_squared(position) <= max_squared) {
      let entry = &self.entries[key];
      for (index, point) in entry.points.iter().enumerate() {
        let distance_squared = point.position.distance_squared(position);
        if distance_squared <= best_squared {
          best_squared = distance_squared;
          best = Some(PickResult {
            node: entry.node,
            index,
            position: point.position,
            distance: distance_squared.sqrt(),
          });
        }
      }
    }
    best
  }

  /// Resident point closest to the ray origin within a cone of `cone_angle`
  /// radians around the ray.
  pub fn pick(&self, ray: &Ray, cone_angle: f64) -> Option<PickResult> {
    let tan_angle = cone_angle.max(0.0).tan();
    let mut best: Option<PickResult> = None;
    for key in self.frontier(|domain| ray.cone_may_hit(domain, tan_angle)) {
      let entry = &self.entries[key];
      for (index, point) in entry.points.iter().enumerate() {
        let Some(along) = ray.cone_hit(point.position, tan_angle) else {
          continue;
        };
        if best.map_or(true, |hit| along < hit.distance) {
          best = Some(PickResult {
            node: entry.node,
            index,
            position: point.position,
            distance: along,
          });
        }
      }
    }
    best
  }

  /// Resident nodes without resident children whose domain passes `keep`.
  fn frontier(&self, keep: impl Fn(&Cube) -> bool) -> Vec<EntryKey> {
    let mut found = Vec::new();
    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
      let node = self.skeleton.node(id);
      if !keep(&node.domain) {
        continue;
      }
      let Some(key) = self.resident[id.index()] else {
        continue;
      };
      let Some(entry) = self.entries.get(key) else {
        continue;
      };
      match node.children() {
        Some(children) if entry.children_resident => stack.extend(children),
        _ => found.push(key),
      }
    }
    found
  }
}
