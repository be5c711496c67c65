use std::fs;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use glam::DVec3;

use super::*;
use crate::accumulator::OffsetMode;
use crate::error::ErrorKind;
use crate::normals::{Neighborhood, NormalCalculator};
use crate::octree::{FrameBudget, RuntimeConfig};
use crate::runtime::Interactor;
use crate::test_utils::{build_dataset_with_offset, noisy_plane, test_config, uniform_cube, TestDataset};
use crate::types::{PointFormat, Rgba};

const CACHE: usize = 64 << 20;
const OFFSET: DVec3 = DVec3::new(481_000.0, 5_402_000.0, 310.0);

/// Uniform cube in source coordinates far from the origin, stored relative to `OFFSET`.
fn offset_dataset() -> TestDataset {
  let points = uniform_cube(4_000, 7)
    .into_iter()
    .map(|mut point| {
      point.position = point.position * 10.0 + OFFSET;
      point
    })
    .collect();
  build_dataset_with_offset(points, OffsetMode::Fixed(OFFSET), |dir| {
    test_config(dir, 500, PointFormat::F64)
  })
}

/// Every actual point matches a distinct expected point within `tolerance`.
fn assert_same_points(actual: Vec<LidarPoint>, expected: &[LidarPoint], tolerance: f64) {
  assert_eq!(actual.len(), expected.len());
  let mut expected = expected.to_vec();
  expected.sort_by(|a, b| a.position.x.total_cmp(&b.position.x));
  let mut used = vec![false; expected.len()];
  for point in &actual {
    let start = expected.partition_point(|e| e.position.x < point.position.x - tolerance);
    let found = expected[start..]
      .iter()
      .enumerate()
      .take_while(|(_, e)| e.position.x <= point.position.x + tolerance)
      .find(|&(i, e)| {
        !used[start + i]
          && e.position.distance(point.position) <= tolerance
          && e.color.0[..3] == point.color.0[..3]
      })
      .map(|(i, _)| start + i);
    match found {
      Some(index) => used[index] = true,
      None => panic!("no source point matches {}", point.position),
    }
  }
}

fn parse_ascii(text: &str) -> Vec<LidarPoint> {
  text
    .lines()
    .map(|line| {
      let fields: Vec<&str> = line.split(' ').collect();
      let position = DVec3::new(
        fields[0].parse().unwrap(),
        fields[1].parse().unwrap(),
        fields[2].parse().unwrap(),
      );
      let color = Rgba::new(
        fields[3].parse().unwrap(),
        fields[4].parse().unwrap(),
        fields[5].parse().unwrap(),
        255,
      );
      LidarPoint::new(position, color)
    })
    .collect()
}

#[test]
fn test_format_significant_matches_printf() {
  assert_eq!(format_significant(0.0, 12), "0");
  assert_eq!(format_significant(1234.5678, 12), "1234.5678");
  assert_eq!(format_significant(0.1 + 0.2, 12), "0.3");
  assert_eq!(format_significant(-2.5, 12), "-2.5");
  assert_eq!(format_significant(481_000.123_456_789_01, 12), "481000.123457");
  assert_eq!(format_significant(1e20, 12), "1e+20");
  assert_eq!(format_significant(0.000_012_34, 12), "1.234e-05");
  assert_eq!(format_significant(0.000_1, 12), "0.0001");
  assert_eq!(format_significant(999_999_999_999.9, 12), "1e+12");
  assert_eq!(format_significant(123_456_789_012.0, 12), "123456789012");
}

#[test]
fn test_format_from_path() {
  assert_eq!(ExportFormat::from_path(Path::new("out.LAS")), ExportFormat::las());
  assert_eq!(ExportFormat::from_path(Path::new("out.bin")), ExportFormat::Binary);
  assert_eq!(ExportFormat::from_path(Path::new("out.xyz")), ExportFormat::Ascii);
  assert_eq!(ExportFormat::from_path(Path::new("out")), ExportFormat::Ascii);
}

#[test]
fn test_ascii_export_restores_source_coordinates() {
  let dataset = offset_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  assert_eq!(octree.offset(), OFFSET);
  let path = dataset.dir.path().join("all.xyz");
  let count = export_dataset(&octree, &path, ExportFormat::Ascii, None).unwrap();
  assert_eq!(count, 4_000);

  let exported = parse_ascii(&fs::read_to_string(&path).unwrap());
  // 12 significant digits of ~5.4e6 leave 5 decimals.
  assert_same_points(exported, &dataset.points, 1e-5);
}

#[test]
fn test_box_export_takes_source_coordinates() {
  let dataset = offset_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let bounds = DAabb3::new(OFFSET, OFFSET + DVec3::new(5.0, 10.0, 2.5));
  let expected: Vec<LidarPoint> = dataset
    .points
    .iter()
    .filter(|point| bounds.contains_point(point.position))
    .copied()
    .collect();
  assert!(!expected.is_empty());

  let path = dataset.dir.path().join("box.xyz");
  let count = export_dataset(&octree, &path, ExportFormat::Ascii, Some(&bounds)).unwrap();
  assert_eq!(count as usize, expected.len());
  let exported = parse_ascii(&fs::read_to_string(&path).unwrap());
  assert_same_points(exported, &expected, 1e-5);
}

#[test]
fn test_binary_export_layout() {
  let dataset = offset_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let path = dataset.dir.path().join("all.bin");
  export_dataset(&octree, &path, ExportFormat::Binary, None).unwrap();

  let bytes = fs::read(&path).unwrap();
  assert_eq!(bytes.len(), 28 + 4_000 * 16);
  let mut cursor = Cursor::new(&bytes);
  let offset = codec::read_dvec3(&mut cursor).unwrap();
  assert_eq!(offset, OFFSET);
  let count = cursor.read_u32::<LittleEndian>().unwrap();
  assert_eq!(count, 4_000);

  let mut exported = Vec::new();
  for _ in 0..count {
    let x = cursor.read_f32::<LittleEndian>().unwrap() as f64;
    let y = cursor.read_f32::<LittleEndian>().unwrap() as f64;
    let z = cursor.read_f32::<LittleEndian>().unwrap() as f64;
    let mut color = [0u8; 4];
    std::io::Read::read_exact(&mut cursor, &mut color).unwrap();
    exported.push(LidarPoint::new(DVec3::new(x, y, z) + offset, Rgba(color)));
  }
  assert_same_points(exported, &dataset.points, 1e-5);
}

#[test]
fn test_las_export_header_and_records() {
  let dataset = offset_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let path = dataset.dir.path().join("all.las");
  let scale = DVec3::new(0.001, 0.001, 0.0005);
  export_dataset(&octree, &path, ExportFormat::Las { scale }, None).unwrap();

  let bytes = fs::read(&path).unwrap();
  assert_eq!(bytes.len(), LAS_HEADER_SIZE as usize + 4_000 * LAS_RECORD_SIZE as usize);
  assert_eq!(&bytes[..4], b"LASF");
  assert_eq!(bytes[24..26], [1, 2]);
  let at = |position: u64| {
    let mut cursor = Cursor::new(&bytes);
    cursor.set_position(position);
    cursor
  };
  assert_eq!(at(94).read_u16::<LittleEndian>().unwrap(), LAS_HEADER_SIZE);
  assert_eq!(at(96).read_u32::<LittleEndian>().unwrap(), LAS_HEADER_SIZE as u32);
  assert_eq!(bytes[104], LAS_POINT_FORMAT);
  assert_eq!(at(105).read_u16::<LittleEndian>().unwrap(), LAS_RECORD_SIZE);
  assert_eq!(at(107).read_u32::<LittleEndian>().unwrap(), 4_000);
  assert_eq!(at(111).read_u32::<LittleEndian>().unwrap(), 4_000);
  assert_eq!(codec::read_dvec3(&mut at(131)).unwrap(), scale);
  let las_offset = codec::read_dvec3(&mut at(155)).unwrap();
  assert!(las_offset.distance(octree.domain().center + OFFSET) < 1e-9);

  let mut expected_bounds = DAabb3::EMPTY;
  dataset.points.iter().for_each(|p| expected_bounds.add_point(p.position));
  let mut cursor = at(179);
  for axis in 0..3 {
    let max = cursor.read_f64::<LittleEndian>().unwrap();
    let min = cursor.read_f64::<LittleEndian>().unwrap();
    assert!((max - expected_bounds.max[axis]).abs() < 1e-6);
    assert!((min - expected_bounds.min[axis]).abs() < 1e-6);
  }

  let mut cursor = at(LAS_HEADER_SIZE as u64);
  let mut exported = Vec::new();
  for _ in 0..4_000 {
    let q = DVec3::new(
      cursor.read_i32::<LittleEndian>().unwrap() as f64,
      cursor.read_i32::<LittleEndian>().unwrap() as f64,
      cursor.read_i32::<LittleEndian>().unwrap() as f64,
    );
    let intensity = cursor.read_u16::<LittleEndian>().unwrap();
    cursor.set_position(cursor.position() + 6);
    let rgb = [0; 3].map(|_: u8| cursor.read_u16::<LittleEndian>().unwrap());
    assert!(rgb.iter().all(|c| c % 257 == 0));
    let color = Rgba::new((rgb[0] / 257) as u8, (rgb[1] / 257) as u8, (rgb[2] / 257) as u8, 255);
    let [r, g, b, _] = color.0;
    assert_eq!(intensity, (r as u16 + g as u16 + b as u16 + 1) / 3);
    exported.push(LidarPoint::new(q * scale + las_offset, color));
  }
  assert_same_points(exported, &dataset.points, 0.5 * scale.length() + 1e-7);
}

#[test]
fn test_las_rejects_bad_scale() {
  let out = Cursor::new(Vec::new());
  assert!(LasWriter::new(out, DVec3::ZERO, DVec3::ZERO, DVec3::new(0.001, 0.0, 0.001)).is_err());
}

#[test]
fn test_las_rejects_points_outside_integer_range() {
  let scale = DVec3::splat(0.001);
  let mut writer = LasWriter::new(Cursor::new(Vec::new()), OFFSET, DVec3::ZERO, scale).unwrap();
  writer
    .write_point(&LidarPoint::new(DVec3::new(2.0e6, -2.0e6, 0.0), Rgba::WHITE))
    .unwrap();
  let err = writer
    .write_point(&LidarPoint::new(DVec3::new(0.0, 0.0, -3.0e6), Rgba::WHITE))
    .unwrap_err();
  assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  assert_eq!(writer.finish().unwrap(), 1);
}

#[test]
fn test_empty_box_writes_valid_headers() {
  let dataset = offset_dataset();
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  let far = DAabb3::new(DVec3::splat(-10.0), DVec3::splat(-5.0));
  let path = dataset.dir.path().join("empty.las");
  assert_eq!(export_dataset(&octree, &path, ExportFormat::las(), Some(&far)).unwrap(), 0);
  let bytes = fs::read(&path).unwrap();
  assert_eq!(bytes.len(), LAS_HEADER_SIZE as usize);
}

#[test]
fn test_save_selection() {
  let dataset = offset_dataset();
  let config = RuntimeConfig {
    budget: FrameBudget::UNLIMITED,
    ..RuntimeConfig::default()
  };
  let mut runtime = RuntimeOctree::open(dataset.path(), config).unwrap();
  let brush = Interactor::new(DVec3::splat(5.0), 2.0);
  runtime.interact(&brush);
  // Counts coarse copies in interior nodes too.
  let selected = runtime.select_points(&brush);
  let expected: Vec<LidarPoint> = dataset
    .points
    .iter()
    .filter(|point| brush.contains(point.position - OFFSET))
    .copied()
    .collect();
  assert!(selected >= expected.len());

  let path = dataset.dir.path().join("selection.xyz");
  let saved = save_selection(&runtime, &path, false).unwrap();
  assert_eq!(saved as usize, expected.len());
  let saved = parse_ascii(&fs::read_to_string(&path).unwrap());
  assert_same_points(saved, &expected, 1e-5);

  let err = save_selection(&runtime, &path, true).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_save_selection_with_normals() {
  let dataset = build_dataset_with_offset(noisy_plane(40, 0.5, 3), OffsetMode::Zero, |dir| {
    test_config(dir, 400, PointFormat::F64)
  });
  let octree = ProcessOctree::open(dataset.path(), CACHE).unwrap();
  NormalCalculator::new(&octree, Neighborhood::Radius(0.08), 2)
    .unwrap()
    .compute()
    .unwrap();

  let config = RuntimeConfig {
    budget: FrameBudget::UNLIMITED,
    ..RuntimeConfig::default()
  };
  let mut runtime = RuntimeOctree::open(dataset.path(), config).unwrap();
  assert!(runtime.has_normals());
  let brush = Interactor::new(DVec3::new(0.5, 0.5, 0.5), 0.25);
  runtime.interact(&brush);
  assert!(runtime.select_points(&brush) > 0);
  let finest = runtime.process_selected_points(|_, normal| assert!(normal.is_some()));

  let path = dataset.dir.path().join("selection.xyzn");
  assert_eq!(save_selection(&runtime, &path, true).unwrap() as usize, finest);
  for line in fs::read_to_string(&path).unwrap().lines() {
    let fields: Vec<f64> = line.split(' ').map(|f| f.parse().unwrap()).collect();
    assert_eq!(fields.len(), 9);
    assert!(fields[8].abs() > 0.99, "normal z in {line}");
  }
}
