//! Shared fixtures for unit tests.

use std::path::{Path, PathBuf};

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::accumulator::{OffsetMode, PointAccumulator};
use crate::creator::{DatasetSummary, OctreeCreator};
use crate::octree::BuildConfig;
use crate::types::{LidarPoint, PointFormat, Rgba};

/// `count` points uniformly distributed in the unit cube with random colors.
pub fn uniform_cube(count: usize, seed: u64) -> Vec<LidarPoint> {
  let mut rng = StdRng::seed_from_u64(seed);
  (0..count)
    .map(|_| {
      let position = DVec3::new(rng.random(), rng.random(), rng.random());
      let color = Rgba::new(rng.random(), rng.random(), rng.random(), 255);
      LidarPoint::new(position, color)
    })
    .collect()
}

/// Points on the plane `z = height` inside the unit square, on a jittered grid.
pub fn noisy_plane(side: usize, height: f64, seed: u64) -> Vec<LidarPoint> {
  let mut rng = StdRng::seed_from_u64(seed);
  let step = 1.0 / side as f64;
  let mut points = Vec::with_capacity(side * side);
  for i in 0..side {
    for j in 0..side {
      let x = (i as f64 + rng.random_range(0.1..0.9)) * step;
      let y = (j as f64 + rng.random_range(0.1..0.9)) * step;
      points.push(LidarPoint::new(DVec3::new(x, y, height), Rgba::WHITE));
    }
  }
  points
}

/// Build config that keeps all temporary files under `dir`.
pub fn test_config(dir: &Path, max_points_per_node: u32, format: PointFormat) -> BuildConfig {
  BuildConfig {
    temp_dir: Some(dir.to_path_buf()),
    point_format: format,
    num_threads: 2,
    ..BuildConfig::default().with_max_points(max_points_per_node)
  }
}

/// A dataset built into a temporary directory.
pub struct TestDataset {
  pub dir: TempDir,
  pub points: Vec<LidarPoint>,
  pub summary: DatasetSummary,
}

impl TestDataset {
  /// Dataset directory.
  pub fn path(&self) -> PathBuf {
    self.dir.path().join("dataset")
  }
}

/// Run the whole build pipeline on `points` with a zero offset.
pub fn build_dataset(points: Vec<LidarPoint>, config_for: impl FnOnce(&Path) -> BuildConfig) -> TestDataset {
  build_dataset_with_offset(points, OffsetMode::Zero, config_for)
}

/// Run the whole build pipeline on `points` given in source coordinates.
pub fn build_dataset_with_offset(
  points: Vec<LidarPoint>,
  offset_mode: OffsetMode,
  config_for: impl FnOnce(&Path) -> BuildConfig,
) -> TestDataset {
  let dir = tempfile::tempdir().unwrap();
  let config = config_for(dir.path());
  let mut accumulator = PointAccumulator::new(&config).unwrap();
  accumulator.set_offset_mode(offset_mode).unwrap();
  for point in &points {
    accumulator
      .add_point(point.position, point.color.0.map(f32::from))
      .unwrap();
  }
  let accumulated = accumulator.finish().unwrap();
  let creator = OctreeCreator::new(config).unwrap();
  let summary = creator
    .create(accumulated, &dir.path().join("dataset"))
    .unwrap();
  TestDataset {
    dir,
    points,
    summary,
  }
}

/// 10,000 uniform points, at most 1,000 per node, stored as `f64`.
pub fn uniform_dataset() -> TestDataset {
  build_dataset(uniform_cube(10_000, 42), |dir| {
    test_config(dir, 1_000, PointFormat::F64)
  })
}
