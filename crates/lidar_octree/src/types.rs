//! Core value types shared by the builder, the readers, and the runtime cache.

use glam::{DVec3, Vec3};

use crate::constants::COLOR_SIZE;

/// 8-bit RGBA color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
  pub const WHITE: Self = Self([255, 255, 255, 255]);

  #[inline]
  pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
    Self([r, g, b, a])
  }

  /// Convert from floating-point channels in `[0, 255]`, clamping and rounding.
  #[inline]
  pub fn from_channels(channels: [f32; 4]) -> Self {
    Self(channels.map(|c| c.round().clamp(0.0, 255.0) as u8))
  }
}

/// A single point: post-offset position plus color.
///
/// Points carry no identity beyond their index inside a node's data block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LidarPoint {
  pub position: DVec3,
  pub color: Rgba,
}

impl LidarPoint {
  #[inline]
  pub fn new(position: DVec3, color: Rgba) -> Self {
    Self { position, color }
  }

  /// Bit pattern of the position, usable as an exact-match hash key.
  ///
  /// `-0.0` is folded onto `0.0` so equal coordinates always produce equal keys.
  #[inline]
  pub fn position_key(&self) -> [u64; 3] {
    let p = self.position + DVec3::ZERO;
    [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]
  }
}

/// Per-point normal as stored in the `Normals` file.
pub type Normal = Vec3;

/// Coordinate precision of a dataset's point records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PointFormat {
  /// `3 x f32 + rgba`, 16 bytes per record.
  #[default]
  F32,
  /// `3 x f64 + rgba`, 28 bytes per record.
  F64,
}

impl PointFormat {
  /// Size of one encoded point record in bytes.
  #[inline]
  pub const fn record_size(self) -> u32 {
    match self {
      Self::F32 => 3 * 4 + COLOR_SIZE,
      Self::F64 => 3 * 8 + COLOR_SIZE,
    }
  }

  /// Recover the format from the record size stored in an index header.
  pub fn from_record_size(size: u32) -> Option<Self> {
    [Self::F32, Self::F64]
      .into_iter()
      .find(|format| format.record_size() == size)
  }

  /// Round a position to the precision this format stores.
  ///
  /// Applying this before partitioning keeps the stored coordinates and the
  /// node assignment consistent.
  #[inline]
  pub fn quantize(self, position: DVec3) -> DVec3 {
    match self {
      Self::F32 => position.as_vec3().as_dvec3(),
      Self::F64 => position,
    }
  }
}

/// Running per-channel min/max over colors, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorExtents {
  pub min: [f32; 4],
  pub max: [f32; 4],
}

impl ColorExtents {
  /// Extents that contain nothing.
  pub const EMPTY: Self = Self {
    min: [f32::INFINITY; 4],
    max: [f32::NEG_INFINITY; 4],
  };

  #[inline]
  pub fn add(&mut self, channels: [f32; 4]) {
    for i in 0..4 {
      self.min[i] = self.min[i].min(channels[i]);
      self.max[i] = self.max[i].max(channels[i]);
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.min[0] > self.max[0]
  }
}

impl Default for ColorExtents {
  fn default() -> Self {
    Self::EMPTY
  }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
