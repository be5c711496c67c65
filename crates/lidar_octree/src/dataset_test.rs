use glam::DVec3;

use super::*;
use crate::error::ErrorKind;

fn header() -> IndexHeader {
  IndexHeader {
    point_format: PointFormat::F32,
    center: DVec3::splat(0.5),
    radius: 0.5,
    max_points_per_node: 4,
  }
}

fn leaf(data_offset: u64, num_points: u32) -> NodeRecord {
  NodeRecord {
    children_offset: 0,
    detail_size: 0.1,
    data_offset,
    num_points,
  }
}

/// Root with one level of 8 leaves, one point each.
fn two_level_index() -> Vec<u8> {
  let mut bytes = Vec::new();
  header().write_to(&mut bytes).unwrap();
  NodeRecord {
    children_offset: INDEX_HEADER_SIZE + NODE_RECORD_SIZE,
    detail_size: 0.5,
    data_offset: 0,
    num_points: 4,
  }
  .write_to(&mut bytes)
  .unwrap();
  for octant in 0..8 {
    leaf(4 + octant, 1).write_to(&mut bytes).unwrap();
  }
  bytes
}

#[test]
fn test_parse_two_level_index() {
  let skeleton = Skeleton::parse(&two_level_index(), |_| 12).unwrap();
  assert_eq!(skeleton.len(), 9);
  assert_eq!(skeleton.depth(), 1);
  assert_eq!(skeleton.num_leaf_points(), 8);
  assert_eq!(skeleton.leaves().count(), 8);

  let root = skeleton.root();
  let children = root.children().expect("root is interior");
  for (octant, child) in children.iter().enumerate() {
    let node = skeleton.node(*child);
    assert_eq!(node.parent, Some(NodeId::ROOT));
    assert_eq!(node.domain, root.domain.child(octant));
    assert_eq!(node.data_offset, 4 + octant as u64);
  }
}

#[test]
fn test_child_offset_past_end_is_corruption() {
  let mut bytes = two_level_index();
  bytes.truncate(bytes.len() - NODE_RECORD_SIZE as usize);
  let err = Skeleton::parse(&bytes, |_| 12).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Corruption);
  assert!(matches!(err, OctreeError::CorruptIndex { node, .. } if node == NodeId::ROOT));
}

#[test]
fn test_self_referencing_child_offset_is_corruption() {
  let mut bytes = Vec::new();
  header().write_to(&mut bytes).unwrap();
  NodeRecord {
    children_offset: INDEX_HEADER_SIZE,
    detail_size: 0.5,
    data_offset: 0,
    num_points: 1,
  }
  .write_to(&mut bytes)
  .unwrap();
  bytes.resize(bytes.len() + CHILD_BLOCK_SIZE as usize, 0);
  let err = Skeleton::parse(&bytes, |_| 1).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_point_block_past_end_is_corruption() {
  let err = Skeleton::parse(&two_level_index(), |_| 11).unwrap_err();
  match err {
    OctreeError::CorruptIndex { node, .. } => assert_eq!(node, NodeId(8)),
    other => panic!("unexpected error {other}"),
  }
}

#[test]
fn test_truncated_header_is_corruption() {
  let err = Skeleton::parse(&[0u8; 10], |_| 0).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_offset_file_roundtrip_and_zero_removes() {
  let dir = tempfile::tempdir().unwrap();
  let paths = DatasetPaths::new(dir.path());
  assert_eq!(read_offset(&paths).unwrap(), DVec3::ZERO);

  let offset = DVec3::new(500000.0, 4200000.0, 100.0);
  write_offset(&paths, offset).unwrap();
  assert_eq!(std::fs::metadata(paths.offset()).unwrap().len(), 24);
  assert_eq!(read_offset(&paths).unwrap(), offset);

  write_offset(&paths, DVec3::ZERO).unwrap();
  assert!(!paths.offset().exists());
}

#[test]
fn test_missing_index_is_configuration_error() {
  let dir = tempfile::tempdir().unwrap();
  let err = Skeleton::load(&DatasetPaths::new(dir.path())).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_normals_writer_renames_on_finish() {
  let dir = tempfile::tempdir().unwrap();
  let paths = DatasetPaths::new(dir.path());
  let skeleton = Skeleton::parse(&two_level_index(), |_| 12).unwrap();

  let mut writer = NormalsWriter::create(&paths, 12).unwrap();
  assert!(!paths.has_normals());
  let child = skeleton.node(NodeId(3));
  writer.write_node(child, &[Normal::new(0.0, 0.0, 1.0)]).unwrap();
  writer.finish().unwrap();
  assert!(paths.has_normals());

  let mut reader = NormalsReader::open(&paths, 12).unwrap();
  let normals = reader.read_node(NodeId(3), child).unwrap();
  assert_eq!(normals, vec![Normal::new(0.0, 0.0, 1.0)]);
  let untouched = reader.read_node(NodeId(4), skeleton.node(NodeId(4))).unwrap();
  assert_eq!(untouched, vec![Normal::ZERO]);
}

#[test]
fn test_normals_length_must_match_point_file() {
  let dir = tempfile::tempdir().unwrap();
  let paths = DatasetPaths::new(dir.path());
  NormalsWriter::create(&paths, 12).unwrap().finish().unwrap();
  assert!(NormalsReader::open(&paths, 12).is_ok());

  // Left over from a dataset with more points.
  let err = NormalsReader::open(&paths, 10).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Corruption);
  assert!(err.to_string().contains("expected 124"), "{err}");

  let file = std::fs::OpenOptions::new().write(true).open(paths.normals()).unwrap();
  file.set_len(NORMALS_HEADER_SIZE + 11 * NORMAL_RECORD_SIZE as u64).unwrap();
  drop(file);
  assert_eq!(NormalsReader::open(&paths, 12).unwrap_err().kind(), ErrorKind::Corruption);
}

#[test]
fn test_remove_normals_clears_partial_file() {
  let dir = tempfile::tempdir().unwrap();
  let paths = DatasetPaths::new(dir.path());
  NormalsWriter::create(&paths, 4).unwrap().finish().unwrap();
  let abandoned = NormalsWriter::create(&paths, 4).unwrap();
  drop(abandoned);
  let partial = paths.normals().with_extension("partial");
  assert!(partial.is_file());

  remove_normals(&paths).unwrap();
  assert!(!paths.has_normals());
  assert!(!partial.exists());
  // Nothing left to remove.
  remove_normals(&paths).unwrap();
}
