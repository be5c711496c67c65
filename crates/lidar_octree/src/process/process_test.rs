use std::collections::HashMap;

use glam::DVec3;

use super::*;
use crate::error::ErrorKind;
use crate::test_utils::uniform_dataset;

const CACHE: usize = 64 << 20;

#[test]
fn test_prefix_visits_parents_first() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let mut order = HashMap::new();
  octree
    .process_nodes_prefix(|id, node, points| {
      assert_eq!(points.len(), node.num_points as usize);
      order.insert(id, order.len());
      Ok(())
    })
    .unwrap();
  assert_eq!(order.len(), octree.num_nodes());
  for (index, node) in octree.skeleton().nodes().iter().enumerate() {
    if let Some(parent) = node.parent {
      assert!(order[&parent] < order[&NodeId(index as u32)]);
    }
  }
}

#[test]
fn test_breadth_first_visits_levels_in_order() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let mut levels = Vec::new();
  octree
    .process_nodes_breadth_first(|id, node, _| {
      if id == NodeId::ROOT {
        assert!(levels.is_empty());
      }
      levels.push(node.level);
      Ok(())
    })
    .unwrap();
  assert_eq!(levels.len(), octree.num_nodes());
  assert!(levels.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn test_postfix_visits_children_first() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let mut order = Vec::new();
  octree
    .process_nodes_postfix(|id, _, _| {
      order.push(id);
      Ok(())
    })
    .unwrap();
  assert_eq!(order.last(), Some(&NodeId::ROOT));
  let position: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
  for (index, node) in octree.skeleton().nodes().iter().enumerate() {
    if let Some(parent) = node.parent {
      assert!(position[&NodeId(index as u32)] < position[&parent]);
    }
  }
}

#[test]
fn test_visitor_error_aborts_traversal() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let mut visits = 0;
  let err = octree
    .process_nodes_prefix(|_, _, _| {
      visits += 1;
      Err(OctreeError::config("stop"))
    })
    .unwrap_err();
  assert_eq!(visits, 1);
  assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_points_in_box_match_brute_force() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let bounds = DAabb3::new(DVec3::new(0.1, 0.2, 0.3), DVec3::new(0.4, 0.9, 0.5));
  let expected = dataset
    .points
    .iter()
    .filter(|p| bounds.contains_point(p.position))
    .count();
  let mut seen = 0;
  let count = octree
    .process_points_in_box(&bounds, |p| {
      assert!(bounds.contains_point(p.position));
      seen += 1;
    })
    .unwrap();
  assert_eq!(count as usize, expected);
  assert_eq!(seen, expected);
}

#[test]
fn test_box_query_skips_distant_leaves() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let bounds = DAabb3::new(DVec3::splat(0.01), DVec3::splat(0.02));
  octree.process_points_in_box(&bounds, |_| {}).unwrap();
  let leaves = octree.skeleton().leaves().count() as u64;
  assert!(octree.stats().nodes_loaded < leaves);
}

#[test]
fn test_points_in_sphere_match_brute_force() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let center = DVec3::splat(0.5);
  let expected = dataset
    .points
    .iter()
    .filter(|p| p.position.distance(center) <= 0.1)
    .count();
  let count = octree.process_points_in_sphere(center, 0.1, |_| {}).unwrap();
  assert_eq!(count as usize, expected);
}

#[test]
fn test_nearest_points_match_brute_force() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  for query in [DVec3::splat(0.5), DVec3::new(0.0, 1.0, 0.3), DVec3::new(2.0, 2.0, 2.0)] {
    let neighbors = octree.nearest_points(query, 12, f64::INFINITY).unwrap();
    let mut expected: Vec<f64> = dataset
      .points
      .iter()
      .map(|p| p.position.distance_squared(query))
      .collect();
    expected.sort_by(f64::total_cmp);
    let found: Vec<f64> = neighbors.iter().map(|n| n.distance_squared).collect();
    assert_eq!(found, expected[..12].to_vec());
  }
}

#[test]
fn test_nearest_points_respect_radius() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let neighbors = octree.nearest_points(DVec3::splat(5.0), 4, 1.0).unwrap();
  assert!(neighbors.is_empty());
  assert!(octree.nearest_points(DVec3::ZERO, 0, 1.0).unwrap().is_empty());
}

#[test]
fn test_cache_serves_repeat_reads() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  octree.node_points(NodeId::ROOT).unwrap();
  octree.node_points(NodeId::ROOT).unwrap();
  let stats = octree.stats();
  assert_eq!(stats.nodes_loaded, 1);
  assert_eq!(stats.cache_hits, 1);
}

#[test]
fn test_normals_required_for_normal_traversal() {
  let dataset = uniform_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert!(!octree.has_normals());
  let err = octree.process_points_with_normals(|_, _| {}).unwrap_err();
  assert!(matches!(err, OctreeError::MissingNormals(_)));
}

#[test]
fn test_open_missing_dataset_is_configuration_error() {
  let dir = tempfile::tempdir().unwrap();
  let err = ProcessOctree::open(dir.path(), CACHE).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);
}
