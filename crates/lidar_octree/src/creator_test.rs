use std::collections::HashSet;
use std::fs;

use glam::DVec3;

use super::*;
use crate::accumulator::{OffsetMode, PointAccumulator};
use crate::error::ErrorKind;
use crate::octree::NodeId;
use crate::process::ProcessOctree;
use crate::test_utils::{build_dataset, test_config, uniform_cube, uniform_dataset};
use crate::types::Rgba;

const CACHE: usize = 64 << 20;

fn sorted_positions(points: &[LidarPoint]) -> Vec<[u64; 3]> {
  let mut keys: Vec<[u64; 3]> = points.iter().map(LidarPoint::position_key).collect();
  keys.sort_unstable();
  keys
}

#[test]
fn test_point_spacing() {
  let cube = Cube::new(DVec3::ZERO, 0.5);
  assert_eq!(point_spacing(&cube, 0), 0.0);
  assert_eq!(point_spacing(&cube, 1), 1.0);
  assert!((point_spacing(&cube, 1000) - 0.1).abs() < 1e-12);
}

/// 10,000 uniform points with a cap of 1,000 split at least once.
#[test]
fn test_uniform_cube_scenario() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();

  assert!(skeleton.depth() >= 1);
  let interior: Vec<_> = skeleton.nodes().iter().filter(|node| !node.is_leaf()).collect();
  assert!(interior.len() >= 1);
  for node in skeleton.nodes() {
    assert!(node.num_points <= 1_000, "node at level {} holds {}", node.level, node.num_points);
  }
  for node in interior {
    assert!(node.num_points > 0, "interior nodes store a subsample");
  }
  assert_eq!(skeleton.num_leaf_points(), 10_000);
  assert_eq!(dataset.summary.num_points, 10_000);
  assert_eq!(dataset.summary.num_nodes, skeleton.len());
  assert_eq!(dataset.summary.depth, skeleton.depth());
}

/// A dense cluster plus one distant point asks for more levels than a
/// dataset may have; the build stops at the depth limit.
#[test]
fn test_far_outlier_stays_within_depth_limit() {
  let mut points = vec![LidarPoint::new(DVec3::ZERO, Rgba::WHITE); 200];
  points.push(LidarPoint::new(DVec3::splat(1e12), Rgba::WHITE));
  let dataset = build_dataset(points, |dir| test_config(dir, 100, PointFormat::F64));
  assert!(dataset.summary.depth < MAX_TREE_DEPTH);

  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert_eq!(octree.skeleton().depth(), dataset.summary.depth);
  assert_eq!(octree.process_points(|_| {}).unwrap(), 201);
}

/// Root growth after deep splits pushes leaves past the limit; the build
/// folds those subtrees into one node.
#[test]
fn test_temp_subtree_past_depth_limit_is_collapsed() {
  let dir = tempfile::tempdir().unwrap();
  let mut temp = TempOctree::new(Some(dir.path()), 16, f64::MIN_POSITIVE).unwrap();
  let mut cluster = vec![LidarPoint::new(DVec3::ZERO, Rgba::WHITE); 40];
  cluster.push(LidarPoint::new(DVec3::ONE, Rgba::WHITE));
  temp.insert_batch(&cluster).unwrap();
  temp
    .insert_batch(&[LidarPoint::new(DVec3::splat(-1e9), Rgba::WHITE)])
    .unwrap();
  temp.finish().unwrap();
  assert!(temp.depth() >= MAX_TREE_DEPTH);

  let config = BuildConfig {
    min_node_radius: f64::MIN_POSITIVE,
    ..test_config(dir.path(), 16, PointFormat::F64)
  };
  let output = dir.path().join("dataset");
  let summary = OctreeCreator::new(config)
    .unwrap()
    .build(&temp)
    .unwrap()
    .write(&output, DVec3::ZERO)
    .unwrap();
  assert_eq!(summary.depth, MAX_TREE_DEPTH - 1);
  assert_eq!(summary.num_points, 42);

  let octree = ProcessOctree::open(&output, CACHE).unwrap();
  let mut at_origin = 0;
  octree
    .process_points(|p| at_origin += (p.position == DVec3::ZERO) as usize)
    .unwrap();
  assert_eq!(at_origin, 40);
}

#[test]
fn test_round_trip_is_complete_and_exact() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let mut visited = Vec::new();
  let count = octree.process_points(|p| visited.push(*p)).unwrap();
  assert_eq!(count, 10_000);
  assert_eq!(sorted_positions(&visited), sorted_positions(&dataset.points));

  let colors: HashSet<_> = dataset.points.iter().map(|p| (p.position_key(), p.color)).collect();
  for point in &visited {
    assert!(colors.contains(&(point.position_key(), point.color)));
  }
}

#[test]
fn test_round_trip_f32_within_tolerance() {
  let points = uniform_cube(3_000, 9);
  let dataset = build_dataset(points.clone(), |dir| test_config(dir, 256, PointFormat::F32));
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert_eq!(octree.point_format(), PointFormat::F32);

  let mut visited = Vec::new();
  octree.process_points(|p| visited.push(*p)).unwrap();
  assert_eq!(visited.len(), points.len());
  let sort = |v: &mut Vec<LidarPoint>| v.sort_by(|a, b| a.position.x.total_cmp(&b.position.x));
  let mut expected = points;
  sort(&mut expected);
  sort(&mut visited);
  for (a, b) in expected.iter().zip(&visited) {
    assert!(a.position.distance(b.position) < 1e-6);
    assert_eq!(a.color, b.color);
  }
}

#[test]
fn test_every_point_lies_in_every_ancestor_domain() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();
  for index in 0..skeleton.len() {
    let id = NodeId(index as u32);
    let points = octree.node_points(id).unwrap();
    let mut ancestor = Some(id);
    while let Some(current) = ancestor {
      let domain = skeleton.node(current).domain;
      for point in points.iter() {
        assert!(domain.contains(point.position), "point outside node {current}");
      }
      ancestor = skeleton.node(current).parent;
    }
  }
}

#[test]
fn test_detail_size_strictly_decreases() {
  let dataset = build_dataset(uniform_cube(5_000, 3), |dir| {
    test_config(dir, 100, PointFormat::F64)
  });
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();
  for node in skeleton.nodes() {
    if let Some(parent) = node.parent {
      assert!(node.detail_size < skeleton.node(parent).detail_size);
    }
  }
}

#[test]
fn test_subsample_points_come_from_children() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();
  for index in 0..skeleton.len() {
    let node = skeleton.node(NodeId(index as u32));
    let Some(children) = node.children() else {
      continue;
    };
    let mut child_points = HashSet::new();
    for child in children {
      for point in octree.node_points(child).unwrap().iter() {
        child_points.insert((point.position_key(), point.color));
      }
    }
    let own = octree.node_points(NodeId(index as u32)).unwrap();
    assert!(!own.is_empty());
    assert!(own.len() <= 1_000);
    for point in own.iter() {
      assert!(child_points.contains(&(point.position_key(), point.color)));
    }
  }
}

#[test]
fn test_rebuild_is_byte_identical_across_thread_counts() {
  let mut points = uniform_cube(4_000, 21);
  // Points sitting exactly on the root's split planes.
  points.push(LidarPoint::new(DVec3::new(0.0, 0.0, 0.0), Rgba::WHITE));
  points.push(LidarPoint::new(DVec3::new(1.0, 1.0, 1.0), Rgba::WHITE));
  let on_plane = LidarPoint::new(DVec3::new(0.5, 0.5, 0.5), Rgba::new(9, 9, 9, 9));
  points.push(on_plane);

  let single = build_dataset(points.clone(), |dir| {
    test_config(dir, 200, PointFormat::F64).with_threads(1)
  });
  let parallel = build_dataset(points, |dir| {
    test_config(dir, 200, PointFormat::F64).with_threads(4)
  });
  for name in ["Index", "Points"] {
    let a = fs::read(single.path().join(name)).unwrap();
    let b = fs::read(parallel.path().join(name)).unwrap();
    assert!(a == b, "{name} differs between builds");
  }

  let octree = ProcessOctree::open(single.path(), CACHE).unwrap();
  let skeleton = octree.skeleton();
  let owners: Vec<NodeId> = skeleton
    .leaves()
    .filter(|&leaf| {
      octree
        .node_points(leaf)
        .unwrap()
        .iter()
        .any(|p| p.position == on_plane.position && p.color == on_plane.color)
    })
    .collect();
  assert_eq!(owners.len(), 1);
}

#[test]
fn test_reopen_yields_identical_traversal() {
  let dataset = uniform_dataset();
  let first: Vec<LidarPoint> = {
    let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
    let mut points = Vec::new();
    octree.process_points(|p| points.push(*p)).unwrap();
    points
  };
  let octree = ProcessOctree::open(dataset.path(), 1).unwrap();
  let mut second = Vec::new();
  octree.process_points(|p| second.push(*p)).unwrap();
  assert_eq!(first, second);
}

#[test]
fn test_truncated_temp_file_fails_with_position() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(dir.path(), 100, PointFormat::F64);
  let mut accumulator = PointAccumulator::new(&config).unwrap();
  accumulator.set_offset_mode(OffsetMode::Zero).unwrap();
  for point in uniform_cube(1_000, 4) {
    accumulator.add_point(point.position, [0.0; 4]).unwrap();
  }
  let accumulated = accumulator.finish().unwrap();

  let victim = fs::read_dir(accumulated.temp_octree.dir())
    .unwrap()
    .map(|entry| entry.unwrap().path())
    .find(|path| fs::metadata(path).unwrap().len() > 0)
    .unwrap();
  let bytes = fs::read(&victim).unwrap();
  fs::write(&victim, &bytes[..bytes.len() / 2]).unwrap();

  let creator = OctreeCreator::new(config).unwrap();
  let err = creator.build(&accumulated.temp_octree).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Build);
  assert!(matches!(err, OctreeError::CorruptTempNode { .. }));
  assert!(err.to_string().contains("temporary node near"));
}

#[test]
fn test_offset_file_written_for_nonzero_offset() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(dir.path(), 64, PointFormat::F32);
  let mut accumulator = PointAccumulator::new(&config).unwrap();
  for point in uniform_cube(500, 8) {
    accumulator
      .add_point(point.position + DVec3::new(500_000.0, 4_000_000.0, 250.0), [0.0; 4])
      .unwrap();
  }
  let accumulated = accumulator.finish().unwrap();
  assert_eq!(accumulated.offset, DVec3::new(500_000.0, 4_000_000.0, 250.0));

  let out = dir.path().join("dataset");
  OctreeCreator::new(config).unwrap().create(accumulated, &out).unwrap();
  let octree = ProcessOctree::open(&out, CACHE).unwrap();
  assert_eq!(octree.offset(), DVec3::new(500_000.0, 4_000_000.0, 250.0));
  assert!(octree.domain().radius < 1.0);
}

#[test]
fn test_small_input_builds_single_leaf_root() {
  let dataset = build_dataset(uniform_cube(50, 2), |dir| {
    test_config(dir, 100, PointFormat::F64)
  });
  assert_eq!(dataset.summary.num_nodes, 1);
  assert_eq!(dataset.summary.depth, 0);
  assert_eq!(dataset.summary.num_records, 50);
}
