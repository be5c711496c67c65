//! Interaction regions: selection brushes and picking rays.

use glam::DVec3;

use crate::octree::{Cube, NodeId};

/// Spherical influence region of a selection tool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interactor {
  pub center: DVec3,
  pub radius: f64,
}

impl Interactor {
  pub fn new(center: DVec3, radius: f64) -> Self {
    Self { center, radius }
  }

  #[inline]
  pub fn contains(&self, point: DVec3) -> bool {
    point.distance_squared(self.center) <= self.radius * self.radius
  }

  #[inline]
  pub fn intersects(&self, domain: &Cube) -> bool {
    domain.intersects_sphere(self.center, self.radius)
  }
}

/// Half-line used for cone picking.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
  pub origin: DVec3,
  /// Unit direction (zero for a degenerate ray, which hits nothing).
  pub direction: DVec3,
}

impl Ray {
  pub fn new(origin: DVec3, direction: DVec3) -> Self {
    Self {
      origin,
      direction: direction.normalize_or_zero(),
    }
  }

  /// Distance along the ray if `point` lies inside the cone of half-angle
  /// `atan(tan_angle)` around it.
  #[inline]
  pub fn cone_hit(&self, point: DVec3, tan_angle: f64) -> Option<f64> {
    let offset = point - self.origin;
    let along = offset.dot(self.direction);
    if along <= 0.0 {
      return None;
    }
    let across_squared = (offset.length_squared() - along * along).max(0.0);
    let reach = along * tan_angle;
    (across_squared <= reach * reach).then_some(along)
  }

  /// Conservative test whether any part of `domain` can be inside the cone.
  pub fn cone_may_hit(&self, domain: &Cube, tan_angle: f64) -> bool {
    if self.direction == DVec3::ZERO {
      return false;
    }
    let bound = domain.radius * 3f64.sqrt();
    let offset = domain.center - self.origin;
    let along = offset.dot(self.direction);
    if along < -bound {
      return false;
    }
    let across = (offset.length_squared() - along * along).max(0.0).sqrt();
    across <= bound + (along + bound).max(0.0) * tan_angle
  }
}

/// A resident point found by a query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PickResult {
  pub node: NodeId,
  /// Index of the point inside its node.
  pub index: usize,
  /// Position in dataset coordinates (offset not applied).
  pub position: DVec3,
  /// Distance to the query position, or along the ray for cone picks.
  pub distance: f64,
}
