use glam::DVec3;

use super::*;

#[test]
fn test_record_sizes() {
  assert_eq!(PointFormat::F32.record_size(), 16);
  assert_eq!(PointFormat::F64.record_size(), 28);
}

#[test]
fn test_format_from_record_size() {
  assert_eq!(PointFormat::from_record_size(16), Some(PointFormat::F32));
  assert_eq!(PointFormat::from_record_size(28), Some(PointFormat::F64));
  assert_eq!(PointFormat::from_record_size(20), None);
}

#[test]
fn test_quantize_f32_is_idempotent() {
  let p = DVec3::new(0.1, 1.0 / 3.0, 12345.678901);
  let once = PointFormat::F32.quantize(p);
  assert_eq!(PointFormat::F32.quantize(once), once);
  assert_ne!(once, p);
  assert_eq!(PointFormat::F64.quantize(p), p);
}

#[test]
fn test_rgba_from_channels_clamps() {
  let c = Rgba::from_channels([-5.0, 12.4, 254.6, 300.0]);
  assert_eq!(c, Rgba::new(0, 12, 255, 255));
}

#[test]
fn test_position_key_folds_negative_zero() {
  let a = LidarPoint::new(DVec3::new(0.0, 1.0, 2.0), Rgba::WHITE);
  let b = LidarPoint::new(DVec3::new(-0.0, 1.0, 2.0), Rgba::default());
  assert_eq!(a.position_key(), b.position_key());
}

#[test]
fn test_color_extents() {
  let mut extents = ColorExtents::default();
  assert!(extents.is_empty());
  extents.add([10.0, 20.0, 30.0, 255.0]);
  extents.add([5.0, 40.0, 30.0, 128.0]);
  assert!(!extents.is_empty());
  assert_eq!(extents.min, [5.0, 20.0, 30.0, 128.0]);
  assert_eq!(extents.max, [10.0, 40.0, 30.0, 255.0]);
}
