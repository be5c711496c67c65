//! Graphics backend seam of the runtime cache.
//!
//! The cache decides which nodes get a GPU copy and when it is dropped; the
//! renderer only creates, releases and draws buffers.

use std::collections::HashMap;

use crate::octree::NodeId;
use crate::types::LidarPoint;

/// Handle of an uploaded node buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

pub trait PointRenderer {
  /// Upload a node's points with their selection flags.
  fn upload(&mut self, node: NodeId, points: &[LidarPoint], selected: &[bool]) -> BufferId;

  fn release(&mut self, buffer: BufferId);

  fn draw_buffer(&mut self, buffer: BufferId);

  /// Draw points straight from CPU memory, for nodes without a buffer.
  fn draw_points(&mut self, points: &[LidarPoint], selected: &[bool]);
}

/// Renderer that only keeps books, for tests and offline tools.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
  next_id: u64,
  /// Points per live buffer.
  live: HashMap<BufferId, usize>,
  pub uploads: usize,
  pub releases: usize,
  pub drawn_points: usize,
  pub buffered_draws: usize,
  pub immediate_draws: usize,
  /// Draws or releases of buffers that were never uploaded or already released.
  pub invalid_calls: usize,
}

impl HeadlessRenderer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn live_buffers(&self) -> usize {
    self.live.len()
  }

  /// Clear per-frame draw counters.
  pub fn begin_frame(&mut self) {
    self.drawn_points = 0;
    self.buffered_draws = 0;
    self.immediate_draws = 0;
  }
}

impl PointRenderer for HeadlessRenderer {
  fn upload(&mut self, _node: NodeId, points: &[LidarPoint], selected: &[bool]) -> BufferId {
    debug_assert_eq!(points.len(), selected.len());
    let id = BufferId(self.next_id);
    self.next_id += 1;
    self.live.insert(id, points.len());
    self.uploads += 1;
    id
  }

  fn release(&mut self, buffer: BufferId) {
    if self.live.remove(&buffer).is_some() {
      self.releases += 1;
    } else {
      self.invalid_calls += 1;
    }
  }

  fn draw_buffer(&mut self, buffer: BufferId) {
    match self.live.get(&buffer) {
      Some(&count) => {
        self.drawn_points += count;
        self.buffered_draws += 1;
      }
      None => self.invalid_calls += 1,
    }
  }

  fn draw_points(&mut self, points: &[LidarPoint], _selected: &[bool]) {
    self.drawn_points += points.len();
    self.immediate_draws += 1;
  }
}
