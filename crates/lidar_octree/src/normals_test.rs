use std::fs;

use glam::DVec3;

use super::*;
use crate::constants::{NORMALS_HEADER_SIZE, NORMAL_RECORD_SIZE};
use crate::accumulator::{OffsetMode, PointAccumulator};
use crate::creator::OctreeCreator;
use crate::error::ErrorKind;
use crate::test_utils::{build_dataset, noisy_plane, test_config};
use crate::types::PointFormat;

const CACHE: usize = 64 << 20;

fn plane_dataset() -> crate::test_utils::TestDataset {
  build_dataset(noisy_plane(60, 0.3, 17), |dir| {
    test_config(dir, 500, PointFormat::F64)
  })
}

#[test]
fn test_invalid_neighborhoods_rejected() {
  assert!(Neighborhood::Radius(0.0).validate().is_err());
  assert!(Neighborhood::Radius(f64::NAN).validate().is_err());
  assert!(Neighborhood::Nearest { k: 2, max_radius: 1.0 }.validate().is_err());
  assert!(Neighborhood::Nearest { k: 8, max_radius: 0.1 }.validate().is_ok());
}

#[test]
fn test_flat_plane_gets_upward_normals() {
  let dataset = plane_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert!(octree.skeleton().depth() >= 1);
  let calculator = NormalCalculator::new(&octree, Neighborhood::Radius(0.05), 3).unwrap();
  let stats = calculator.compute().unwrap();
  assert_eq!(stats.nodes, octree.num_nodes());
  assert_eq!(stats.fitted, 3_600);
  assert_eq!(stats.degenerate, 0);

  let reopened = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert!(reopened.has_normals());
  let count = reopened
    .process_points_with_normals(|_, normal| {
      assert!(normal.dot(Normal::Z) > 0.999, "normal {normal:?}");
    })
    .unwrap();
  assert_eq!(count, 3_600);

  let size = fs::metadata(reopened.paths().normals()).unwrap().len();
  let records = reopened.skeleton().num_point_records();
  assert_eq!(size, NORMALS_HEADER_SIZE + records * NORMAL_RECORD_SIZE as u64);
}

/// Rebuilding into the same directory must not serve the old dataset's
/// normals for the new points.
#[test]
fn test_rebuild_discards_old_normals() {
  let dataset = plane_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  NormalCalculator::new(&octree, Neighborhood::Radius(0.05), 2)
    .unwrap()
    .compute()
    .unwrap();
  drop(octree);

  // Same grid turned into the wall x = 0.3.
  let config = test_config(dataset.dir.path(), 500, PointFormat::F64);
  let mut accumulator = PointAccumulator::new(&config).unwrap();
  accumulator.set_offset_mode(OffsetMode::Zero).unwrap();
  for point in noisy_plane(40, 0.3, 5) {
    let p = point.position;
    accumulator.add_point(DVec3::new(p.z, p.x, p.y), [255.0; 4]).unwrap();
  }
  OctreeCreator::new(config)
    .unwrap()
    .create(accumulator.finish().unwrap(), &dataset.path())
    .unwrap();

  let rebuilt = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert!(!rebuilt.has_normals());
  let err = rebuilt.process_points_with_normals(|_, _| {}).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);

  NormalCalculator::new(&rebuilt, Neighborhood::Radius(0.05), 2)
    .unwrap()
    .compute()
    .unwrap();
  let reopened = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let count = reopened
    .process_points_with_normals(|_, normal| {
      assert!(normal.dot(Normal::X).abs() > 0.999, "normal {normal:?}");
    })
    .unwrap();
  assert_eq!(count, 1_600);
}

#[test]
fn test_parent_normals_come_from_matching_children() {
  let dataset = plane_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  NormalCalculator::new(&octree, Neighborhood::Nearest { k: 10, max_radius: 0.1 }, 2)
    .unwrap()
    .compute()
    .unwrap();

  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();
  for (index, node) in skeleton.nodes().iter().enumerate() {
    let Some(children) = node.children() else {
      continue;
    };
    let id = NodeId(index as u32);
    let mut child_normals = HashMap::new();
    for child in children {
      let points = octree.node_points(child).unwrap();
      let normals = octree.node_normals(child).unwrap();
      for (point, normal) in points.iter().zip(normals.iter()) {
        child_normals.insert(point.position_key(), *normal);
      }
    }
    let points = octree.node_points(id).unwrap();
    let normals = octree.node_normals(id).unwrap();
    for (point, normal) in points.iter().zip(normals.iter()) {
      let expected = child_normals[&point.position_key()];
      assert!((*normal - expected).length() < 1e-6);
    }
  }
}

#[test]
fn test_tampered_subsample_is_reported_as_corruption() {
  let dataset = plane_dataset();
  // The root block is the first block in Points; move its first point away.
  let points_path = dataset.path().join("Points");
  let mut bytes = fs::read(&points_path).unwrap();
  bytes[0..8].copy_from_slice(&7.0f64.to_le_bytes());
  fs::write(&points_path, bytes).unwrap();

  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let err = NormalCalculator::new(&octree, Neighborhood::Radius(0.05), 2)
    .unwrap()
    .compute()
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Corruption);
  match err {
    OctreeError::AncestorNotFound { node, position } => {
      assert_eq!(node, NodeId::ROOT);
      assert_eq!(position.x, 7.0);
    }
    other => panic!("unexpected error {other}"),
  }
  assert!(!octree.paths().has_normals(), "no partial normals file is published");
}

#[test]
fn test_isolated_points_get_zero_normals() {
  let points = vec![
    LidarPoint::new(DVec3::ZERO, crate::types::Rgba::WHITE),
    LidarPoint::new(DVec3::ONE, crate::types::Rgba::WHITE),
  ];
  let dataset = build_dataset(points, |dir| test_config(dir, 16, PointFormat::F64));
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let stats = NormalCalculator::new(&octree, Neighborhood::Radius(0.1), 1)
    .unwrap()
    .compute()
    .unwrap();
  assert_eq!(stats.degenerate, 2);
}
