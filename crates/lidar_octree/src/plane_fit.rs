//! Least-squares plane through a point set.
//!
//! Moments are accumulated relative to the first point added, which keeps
//! the covariance well conditioned for coordinates far from the origin.
//! The plane normal is the eigenvector of the smallest covariance eigenvalue.

use glam::DVec3;
use nalgebra::{Matrix3, SymmetricEigen};

/// Result of a plane fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FittedPlane {
  pub centroid: DVec3,
  /// Unit normal (direction of least variance).
  pub normal: DVec3,
  /// In-plane unit axes, direction of largest variance first.
  pub axes: [DVec3; 2],
  /// Covariance eigenvalues, ascending.
  pub eigenvalues: [f64; 3],
  /// Root mean square distance of the points from the plane.
  pub rms: f64,
}

/// Streaming accumulator of first and second moments.
#[derive(Clone, Debug, Default)]
pub struct PlaneFitter {
  reference: Option<DVec3>,
  count: usize,
  sum: DVec3,
  /// xx, xy, xz, yy, yz, zz
  sum_products: [f64; 6],
}

impl PlaneFitter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_point(&mut self, point: DVec3) {
    let d = point - *self.reference.get_or_insert(point);
    self.count += 1;
    self.sum += d;
    let s = &mut self.sum_products;
    s[0] += d.x * d.x;
    s[1] += d.x * d.y;
    s[2] += d.x * d.z;
    s[3] += d.y * d.y;
    s[4] += d.y * d.z;
    s[5] += d.z * d.z;
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.count
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn centroid(&self) -> Option<DVec3> {
    let reference = self.reference?;
    Some(reference + self.sum / self.count as f64)
  }

  /// Fit a plane; `None` with fewer than 3 points.
  pub fn fit(&self) -> Option<FittedPlane> {
    if self.count < 3 {
      return None;
    }
    let reference = self.reference?;
    let n = self.count as f64;
    let mean = self.sum / n;
    let s = &self.sum_products;
    let xx = s[0] / n - mean.x * mean.x;
    let xy = s[1] / n - mean.x * mean.y;
    let xz = s[2] / n - mean.x * mean.z;
    let yy = s[3] / n - mean.y * mean.y;
    let yz = s[4] / n - mean.y * mean.z;
    let zz = s[5] / n - mean.z * mean.z;
    let covariance = Matrix3::new(xx, xy, xz, xy, yy, yz, xz, yz, zz);

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let vector = |i: usize| {
      let column = eigen.eigenvectors.column(i);
      DVec3::new(column[0], column[1], column[2]).normalize_or_zero()
    };
    let eigenvalues = order.map(|i| eigen.eigenvalues[i]);
    Some(FittedPlane {
      centroid: reference + mean,
      normal: vector(order[0]),
      axes: [vector(order[2]), vector(order[1])],
      eigenvalues,
      rms: eigenvalues[0].max(0.0).sqrt(),
    })
  }
}
