use super::*;
use crate::error::ErrorKind;

#[test]
fn test_default_build_config_is_valid() {
  let config = BuildConfig::default();
  assert!(config.validate().is_ok());
  assert_eq!(config.max_points_per_node, 4096);
  assert_eq!(config.num_threads, 1);
  assert_eq!(config.point_format, PointFormat::F32);
}

#[test]
fn test_zero_threads_rejected() {
  let config = BuildConfig::default().with_threads(0);
  let err = config.validate().unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_tiny_cap_rejected() {
  let config = BuildConfig::default().with_max_points(1);
  assert!(config.validate().is_err());
}

#[test]
fn test_bad_min_radius_rejected() {
  let config = BuildConfig {
    min_node_radius: 0.0,
    ..Default::default()
  };
  assert!(config.validate().is_err());
  let config = BuildConfig {
    min_node_radius: f64::NAN,
    ..Default::default()
  };
  assert!(config.validate().is_err());
}

#[test]
fn test_with_max_points_sets_both_passes() {
  let config = BuildConfig::default().with_max_points(1000);
  assert_eq!(config.max_points_per_node, 1000);
  assert_eq!(config.temp_max_points_per_node, 1000);
}

#[test]
fn test_runtime_config_validation() {
  assert!(RuntimeConfig::default().validate().is_ok());
  let config = RuntimeConfig {
    focus_and_context_weight: -1.0,
    ..Default::default()
  };
  assert!(config.validate().is_err());
  let config = RuntimeConfig {
    memory_cache_bytes: 0,
    ..Default::default()
  };
  assert!(config.validate().is_err());
}
