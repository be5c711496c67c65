//! Front end of the build: transform, offset, buffer, flush.
//!
//! Input producers call [`PointAccumulator::add_point`] once per point in any
//! order. Each point is transformed, shifted by the dataset offset, rounded
//! to the output precision, and buffered. When the buffer reaches its byte
//! budget the whole batch is handed to the [`TempOctree`] and the buffer is
//! cleared, so memory use stays bounded for arbitrarily large inputs.

use std::path::PathBuf;

use glam::{DAffine3, DVec3};

use crate::error::{OctreeError, Result};
use crate::octree::{BuildConfig, DAabb3};
use crate::temp_octree::TempOctree;
use crate::types::{ColorExtents, LidarPoint, PointFormat, Rgba};

/// How the coordinate offset is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum OffsetMode {
  /// Store input coordinates unchanged.
  Zero,
  /// Subtract a fixed offset.
  Fixed(DVec3),
  /// Subtract the floor of the first accepted point.
  #[default]
  Auto,
}

/// Result of the accumulation pass.
#[derive(Debug)]
pub struct Accumulated {
  pub temp_octree: TempOctree,
  /// Offset subtracted from every point; add it back to recover input coordinates.
  pub offset: DVec3,
  /// Extents of the transformed input, before the offset.
  pub extents: DAabb3,
}

#[derive(Debug)]
pub struct PointAccumulator {
  temp_dir: Option<PathBuf>,
  max_points_per_temp_node: u32,
  min_node_radius: f64,
  format: PointFormat,
  max_buffered_points: usize,
  buffer: Vec<LidarPoint>,
  transform: Option<DAffine3>,
  offset_mode: OffsetMode,
  offset: Option<DVec3>,
  extents: DAabb3,
  color_extents: ColorExtents,
  num_points: u64,
  num_rejected: u64,
  temp_octree: Option<TempOctree>,
}

impl PointAccumulator {
  pub fn new(config: &BuildConfig) -> Result<Self> {
    config.validate()?;
    let mut accumulator = Self {
      temp_dir: config.temp_dir.clone(),
      max_points_per_temp_node: config.temp_max_points_per_node,
      min_node_radius: config.min_node_radius,
      format: config.point_format,
      max_buffered_points: 0,
      buffer: Vec::new(),
      transform: None,
      offset_mode: OffsetMode::default(),
      offset: None,
      extents: DAabb3::EMPTY,
      color_extents: ColorExtents::EMPTY,
      num_points: 0,
      num_rejected: 0,
      temp_octree: None,
    };
    accumulator.set_memory_size(config.memory_cache_bytes, config.temp_max_points_per_node)?;
    Ok(accumulator)
  }

  /// Set the buffer budget and the temporary split threshold.
  ///
  /// The threshold can only change before the first flush.
  pub fn set_memory_size(&mut self, bytes: usize, max_points_per_temp_node: u32) -> Result<()> {
    let max_buffered_points = bytes / std::mem::size_of::<LidarPoint>();
    if max_buffered_points == 0 || max_points_per_temp_node == 0 {
      return Err(OctreeError::config(format!(
        "memory size {bytes} bytes / {max_points_per_temp_node} points per node is too small"
      )));
    }
    if self.temp_octree.is_some() && max_points_per_temp_node != self.max_points_per_temp_node {
      return Err(OctreeError::config(
        "temporary node size cannot change after points were flushed",
      ));
    }
    self.max_buffered_points = max_buffered_points;
    self.max_points_per_temp_node = max_points_per_temp_node;
    if self.buffer.len() >= self.max_buffered_points {
      self.flush()?;
    }
    Ok(())
  }

  /// Affine transform applied to raw positions before the offset.
  pub fn set_transform(&mut self, transform: Option<DAffine3>) {
    self.transform = transform;
  }

  /// Choose how the offset is picked. Fails once the offset is fixed.
  pub fn set_offset_mode(&mut self, mode: OffsetMode) -> Result<()> {
    if self.offset.is_some() {
      return Err(OctreeError::config(
        "point offset is already fixed by earlier points",
      ));
    }
    self.offset_mode = mode;
    Ok(())
  }

  /// Offset in effect, `DVec3::ZERO` until it is chosen.
  pub fn point_offset(&self) -> DVec3 {
    self.offset.unwrap_or(DVec3::ZERO)
  }

  /// Add one raw input point. Color channels are in `[0, 255]`.
  ///
  /// Points with non-finite coordinates are counted and skipped.
  pub fn add_point(&mut self, raw_position: DVec3, raw_color: [f32; 4]) -> Result<()> {
    let position = match &self.transform {
      Some(transform) => transform.transform_point3(raw_position),
      None => raw_position,
    };
    if !position.is_finite() {
      self.num_rejected += 1;
      return Ok(());
    }
    let offset = *self.offset.get_or_insert_with(|| match self.offset_mode {
      OffsetMode::Zero => DVec3::ZERO,
      OffsetMode::Fixed(offset) => offset,
      OffsetMode::Auto => position.floor(),
    });

    self.extents.add_point(position);
    self.color_extents.add(raw_color);
    self.buffer.push(LidarPoint::new(
      self.format.quantize(position - offset),
      Rgba::from_channels(raw_color),
    ));
    self.num_points += 1;

    if self.buffer.len() >= self.max_buffered_points {
      self.flush()?;
    }
    Ok(())
  }

  /// Hand the buffered batch to the temporary octree.
  pub fn flush(&mut self) -> Result<()> {
    if self.buffer.is_empty() {
      return Ok(());
    }
    let _span = tracing::info_span!("accumulate::flush", points = self.buffer.len()).entered();
    let tree = match &mut self.temp_octree {
      Some(tree) => tree,
      slot => slot.insert(TempOctree::new(
        self.temp_dir.as_deref(),
        self.max_points_per_temp_node,
        self.min_node_radius,
      )?),
    };
    tree.insert_batch(&self.buffer)?;
    self.buffer.clear();
    Ok(())
  }

  pub fn num_points(&self) -> u64 {
    self.num_points
  }

  /// Points skipped for non-finite coordinates.
  pub fn num_rejected(&self) -> u64 {
    self.num_rejected
  }

  /// Extents of the transformed input, before the offset.
  pub fn extents(&self) -> &DAabb3 {
    &self.extents
  }

  pub fn color_extents(&self) -> &ColorExtents {
    &self.color_extents
  }

  /// Restart extent tracking, e.g. between input files.
  pub fn reset_extents(&mut self) {
    self.extents = DAabb3::EMPTY;
    self.color_extents = ColorExtents::EMPTY;
  }

  /// Log the extents accumulated since the last reset.
  pub fn print_extents(&self) {
    if self.extents.is_empty() {
      tracing::info!("no points accumulated");
      return;
    }
    let (min, max) = (self.extents.min, self.extents.max);
    tracing::info!(
      "position extents: [{:.3}, {:.3}] x [{:.3}, {:.3}] x [{:.3}, {:.3}]",
      min.x, max.x, min.y, max.y, min.z, max.z
    );
    let color = &self.color_extents;
    tracing::info!(
      "color extents: r [{}, {}] g [{}, {}] b [{}, {}] a [{}, {}]",
      color.min[0], color.max[0], color.min[1], color.max[1],
      color.min[2], color.max[2], color.min[3], color.max[3]
    );
  }

  /// Flush the rest and hand over the temporary octree.
  pub fn finish(mut self) -> Result<Accumulated> {
    self.flush()?;
    if self.num_rejected > 0 {
      tracing::warn!(rejected = self.num_rejected, "skipped points with non-finite coordinates");
    }
    let Some(mut temp_octree) = self.temp_octree.take() else {
      return Err(OctreeError::config("no points to build an octree from"));
    };
    temp_octree.finish()?;
    Ok(Accumulated {
      temp_octree,
      offset: self.point_offset(),
      extents: self.extents,
    })
  }
}

#[cfg(test)]
#[path = "accumulator_test.rs"]
mod accumulator_test;
