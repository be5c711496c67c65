//! Build and cache configuration.

use std::path::PathBuf;

use super::budget::FrameBudget;
use crate::constants::{
  DEFAULT_GPU_CACHE_BYTES, DEFAULT_MAX_POINTS_PER_NODE, DEFAULT_MEMORY_CACHE_BYTES,
  DEFAULT_MIN_NODE_RADIUS, DEFAULT_NUM_THREADS, DEFAULT_TEMP_MAX_POINTS_PER_NODE,
};
use crate::error::{OctreeError, Result};
use crate::types::PointFormat;

/// Parameters of the two-pass dataset build.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildConfig {
  /// Maximum points stored in any node of the finished octree.
  pub max_points_per_node: u32,
  /// Split threshold of the temporary octree.
  pub temp_max_points_per_node: u32,
  /// In-memory point buffer budget of the accumulator, in bytes.
  pub memory_cache_bytes: usize,
  /// Worker threads for the final build (1 = build on a single worker).
  pub num_threads: usize,
  /// Coordinate precision of the `Points` file.
  pub point_format: PointFormat,
  /// Nodes this small are never split (coincident point safety valve).
  pub min_node_radius: f64,
  /// Parent directory for temporary node files. `None` uses the system temp dir.
  pub temp_dir: Option<PathBuf>,
}

impl BuildConfig {
  /// Reject parameters the build cannot work with.
  pub fn validate(&self) -> Result<()> {
    if self.max_points_per_node < 2 {
      return Err(OctreeError::config(format!(
        "max_points_per_node must be at least 2, got {}",
        self.max_points_per_node
      )));
    }
    if self.temp_max_points_per_node == 0 {
      return Err(OctreeError::config("temp_max_points_per_node must be positive"));
    }
    if self.num_threads == 0 {
      return Err(OctreeError::config("num_threads must be at least 1"));
    }
    if !(self.min_node_radius > 0.0 && self.min_node_radius.is_finite()) {
      return Err(OctreeError::config(format!(
        "min_node_radius must be positive and finite, got {}",
        self.min_node_radius
      )));
    }
    if self.memory_cache_bytes < std::mem::size_of::<crate::types::LidarPoint>() {
      return Err(OctreeError::config(format!(
        "memory_cache_bytes too small to buffer a single point: {}",
        self.memory_cache_bytes
      )));
    }
    Ok(())
  }

  /// Builder-style thread count.
  pub fn with_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  /// Builder-style per-node cap for both passes.
  pub fn with_max_points(mut self, max_points_per_node: u32) -> Self {
    self.max_points_per_node = max_points_per_node;
    self.temp_max_points_per_node = max_points_per_node;
    self
  }
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      max_points_per_node: DEFAULT_MAX_POINTS_PER_NODE,
      temp_max_points_per_node: DEFAULT_TEMP_MAX_POINTS_PER_NODE,
      memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
      num_threads: DEFAULT_NUM_THREADS,
      point_format: PointFormat::F32,
      min_node_radius: DEFAULT_MIN_NODE_RADIUS,
      temp_dir: None,
    }
  }
}

/// Parameters of the interactive cache.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
  /// CPU node cache budget in bytes.
  pub memory_cache_bytes: usize,
  /// GPU buffer budget in bytes.
  pub gpu_cache_bytes: usize,
  /// Bytes a point occupies once uploaded.
  pub gpu_bytes_per_point: usize,
  /// LOD quality: 0 targets one pixel of projected spacing, each step
  /// up halves the target and each step down doubles it.
  pub render_quality: f64,
  /// Focus+context falloff weight (0 disables the heuristic).
  pub focus_and_context_weight: f64,
  /// Per-frame load and upload limits.
  pub budget: FrameBudget,
}

impl RuntimeConfig {
  pub fn validate(&self) -> Result<()> {
    if self.memory_cache_bytes == 0 {
      return Err(OctreeError::config("memory_cache_bytes must be positive"));
    }
    if !self.render_quality.is_finite() {
      return Err(OctreeError::config("render_quality must be finite"));
    }
    if !(self.focus_and_context_weight >= 0.0) {
      return Err(OctreeError::config(format!(
        "focus_and_context_weight must be non-negative, got {}",
        self.focus_and_context_weight
      )));
    }
    Ok(())
  }
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
      gpu_cache_bytes: DEFAULT_GPU_CACHE_BYTES,
      gpu_bytes_per_point: 16,
      render_quality: 0.0,
      focus_and_context_weight: 0.5,
      budget: FrameBudget::DEFAULT,
    }
  }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
