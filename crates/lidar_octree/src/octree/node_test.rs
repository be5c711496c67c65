use glam::DVec3;

use super::*;

fn interior() -> OctreeNode {
  OctreeNode {
    domain: Cube::new(DVec3::ZERO, 1.0),
    detail_size: 0.5,
    data_offset: 0,
    num_points: 10,
    level: 0,
    parent: None,
    first_child: Some(NodeId(1)),
  }
}

/// Children of an interior node are consecutive ids in octant order.
#[test]
fn test_children_are_consecutive() {
  let node = interior();
  let children = node.children().expect("interior node has children");
  for (octant, child) in children.iter().enumerate() {
    assert_eq!(child.0, 1 + octant as u32);
    assert_eq!(node.child(octant), Some(*child));
  }
  assert!(!node.is_leaf());
}

#[test]
fn test_leaf_has_no_children() {
  let node = OctreeNode {
    first_child: None,
    ..interior()
  };
  assert!(node.is_leaf());
  assert_eq!(node.children(), None);
  assert_eq!(node.child(3), None);
}

#[test]
fn test_node_id_display() {
  assert_eq!(NodeId(42).to_string(), "42");
  assert_eq!(NodeId::ROOT.index(), 0);
}
