//! Double-precision spatial domains: axis-aligned boxes and octree cubes.

use glam::DVec3;

/// Closed box in dataset or source coordinates.
///
/// Tracks point extents during accumulation and bounds range queries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DAabb3 {
	pub min: DVec3,
	pub max: DVec3,
}

impl DAabb3 {
	/// A box containing nothing. Adding a point makes it that point.
	pub const EMPTY: Self = Self {
		min: DVec3::INFINITY,
		max: DVec3::NEG_INFINITY,
	};

	pub fn new(min: DVec3, max: DVec3) -> Self {
		debug_assert!(min.cmple(max).all(), "inverted box {min} .. {max}");
		Self { min, max }
	}

	/// True until the first point is added.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.min.cmpgt(self.max).any()
	}

	/// Grow the box to include `point`.
	#[inline]
	pub fn add_point(&mut self, point: DVec3) {
		self.min = self.min.min(point);
		self.max = self.max.max(point);
	}

	/// Smallest box containing both boxes.
	#[inline]
	pub fn union(&self, other: &DAabb3) -> DAabb3 {
		Self {
			min: self.min.min(other.min),
			max: self.max.max(other.max),
		}
	}

	/// Shared faces count as overlap.
	#[inline]
	pub fn overlaps(&self, other: &DAabb3) -> bool {
		self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
	}

	/// Closed containment.
	#[inline]
	pub fn contains_point(&self, point: DVec3) -> bool {
		self.min.cmple(point).all() && point.cmple(self.max).all()
	}

	/// Squared distance from `point` to the box (0 inside).
	#[inline]
	pub fn distance_squared(&self, point: DVec3) -> f64 {
		let clamped = point.clamp(self.min, self.max);
		point.distance_squared(clamped)
	}

	#[inline]
	pub fn size(&self) -> DVec3 {
		self.max - self.min
	}

	#[inline]
	pub fn center(&self) -> DVec3 {
		(self.min + self.max) * 0.5
	}
}

impl Default for DAabb3 {
	fn default() -> Self {
		Self::EMPTY
	}
}

/// Cubic node domain: center plus half edge length.
///
/// Children are exact half-size subdivisions. Octant bits follow the node
/// convention: bit 0 = +X, bit 1 = +Y, bit 2 = +Z.
///
/// # Boundary rule
///
/// A point is routed to the child whose half-interval on each axis is
/// `[center - radius, center)` (bit clear) or `[center, center + radius]`
/// (bit set). A coordinate exactly on the split plane always goes to the
/// upper child, so every point lands in exactly one child.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cube {
	pub center: DVec3,
	pub radius: f64,
}

impl Cube {
	#[inline]
	pub fn new(center: DVec3, radius: f64) -> Self {
		Self { center, radius }
	}

	/// Smallest cube centered on `aabb` that contains it, never thinner than `min_radius`.
	pub fn bounding(aabb: &DAabb3, min_radius: f64) -> Self {
		let half = aabb.size() * 0.5;
		Self {
			center: aabb.center(),
			radius: half.max_element().max(min_radius),
		}
	}

	#[inline]
	pub fn min(&self) -> DVec3 {
		self.center - DVec3::splat(self.radius)
	}

	#[inline]
	pub fn max(&self) -> DVec3 {
		self.center + DVec3::splat(self.radius)
	}

	#[inline]
	pub fn diameter(&self) -> f64 {
		2.0 * self.radius
	}

	#[inline]
	pub fn aabb(&self) -> DAabb3 {
		DAabb3 {
			min: self.min(),
			max: self.max(),
		}
	}

	/// Closed containment: points on any face count as inside.
	#[inline]
	pub fn contains(&self, point: DVec3) -> bool {
		(point - self.center).abs().max_element() <= self.radius
	}

	/// Octant of the child that owns `point` under the boundary rule.
	#[inline]
	pub fn child_index(&self, point: DVec3) -> usize {
		let mut index = 0;
		if point.x >= self.center.x {
			index |= 1;
		}
		if point.y >= self.center.y {
			index |= 2;
		}
		if point.z >= self.center.z {
			index |= 4;
		}
		index
	}

	/// Domain of the child in `octant`.
	#[inline]
	pub fn child(&self, octant: usize) -> Cube {
		let half = self.radius * 0.5;
		let sign = |bit: usize| if octant & bit != 0 { half } else { -half };
		Cube {
			center: self.center + DVec3::new(sign(1), sign(2), sign(4)),
			radius: half,
		}
	}

	/// Double the cube toward `point`.
	///
	/// Returns the enlarged cube and the octant `self` occupies inside it.
	pub fn grow_towards(&self, point: DVec3) -> (Cube, usize) {
		let mut center = self.center;
		let mut octant = 0;
		let below = point.cmplt(self.min());
		for (axis, bit) in [(0, 1), (1, 2), (2, 4)] {
			if below.test(axis) {
				center[axis] -= self.radius;
				octant |= bit;
			} else {
				center[axis] += self.radius;
			}
		}
		(Cube::new(center, self.radius * 2.0), octant)
	}

	#[inline]
	pub fn overlaps_aabb(&self, aabb: &DAabb3) -> bool {
		self.aabb().overlaps(aabb)
	}

	/// Squared distance from `point` to the cube (0 inside).
	#[inline]
	pub fn distance_squared(&self, point: DVec3) -> f64 {
		self.aabb().distance_squared(point)
	}

	#[inline]
	pub fn intersects_sphere(&self, center: DVec3, radius: f64) -> bool {
		self.distance_squared(center) <= radius * radius
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_empty_then_add() {
		let mut extents = DAabb3::EMPTY;
		assert!(extents.is_empty());
		extents.add_point(DVec3::new(1.0, 2.0, 3.0));
		assert!(!extents.is_empty());
		assert_eq!(extents.size(), DVec3::ZERO);
		extents.add_point(DVec3::new(-1.0, 5.0, 0.0));
		assert_eq!(extents, DAabb3::new(DVec3::new(-1.0, 2.0, 0.0), DVec3::new(1.0, 5.0, 3.0)));
		assert_eq!(extents.center(), DVec3::new(0.0, 3.5, 1.5));
	}

	#[test]
	fn test_overlap_and_containment_are_closed() {
		let unit = DAabb3::new(DVec3::ZERO, DVec3::ONE);
		let corner = DAabb3::new(DVec3::ONE, DVec3::splat(2.0));
		let apart = DAabb3::new(DVec3::new(1.5, 0.0, 0.0), DVec3::splat(2.0));
		assert!(unit.overlaps(&corner) && corner.overlaps(&unit));
		assert!(!unit.overlaps(&apart));
		assert!(unit.contains_point(DVec3::ONE));
		assert!(!unit.contains_point(DVec3::new(0.5, 1.0 + 1e-12, 0.5)));
	}

	#[test]
	fn test_distance_squared() {
		let aabb = DAabb3::new(DVec3::ZERO, DVec3::ONE);
		assert_eq!(aabb.distance_squared(DVec3::splat(0.5)), 0.0);
		assert_eq!(aabb.distance_squared(DVec3::new(3.0, 0.5, 0.5)), 4.0);
	}

	#[test]
	fn test_cube_child_index_boundary_goes_up() {
		let cube = Cube::new(DVec3::ZERO, 1.0);
		assert_eq!(cube.child_index(DVec3::ZERO), 7);
		assert_eq!(cube.child_index(DVec3::new(-1e-12, 0.0, -1.0)), 2);
		assert_eq!(cube.child_index(DVec3::new(0.5, -0.5, 0.5)), 5);
	}

	#[test]
	fn test_cube_children_tile_parent() {
		let cube = Cube::new(DVec3::new(1.0, 2.0, 3.0), 4.0);
		for octant in 0..8 {
			let child = cube.child(octant);
			assert_eq!(child.radius, 2.0);
			assert!(cube.contains(child.min()));
			assert!(cube.contains(child.max()));
			assert_eq!(cube.child_index(child.center), octant);
		}
	}

	#[test]
	fn test_cube_contains_is_closed() {
		let cube = Cube::new(DVec3::ZERO, 1.0);
		assert!(cube.contains(DVec3::splat(1.0)));
		assert!(cube.contains(DVec3::splat(-1.0)));
		assert!(!cube.contains(DVec3::new(1.0 + 1e-9, 0.0, 0.0)));
	}

	#[test]
	fn test_grow_towards_keeps_old_cube_as_child() {
		let cube = Cube::new(DVec3::ZERO, 1.0);
		for target in [DVec3::splat(5.0), DVec3::splat(-5.0), DVec3::new(5.0, -5.0, 0.0)] {
			let (grown, octant) = cube.grow_towards(target);
			assert_eq!(grown.radius, 2.0);
			assert_eq!(grown.child(octant), cube);
		}
	}

	#[test]
	fn test_bounding_cube_contains_box() {
		let aabb = DAabb3::new(DVec3::new(0.0, 0.0, 0.0), DVec3::new(4.0, 1.0, 2.0));
		let cube = Cube::bounding(&aabb, 1e-3);
		assert!(cube.contains(aabb.min));
		assert!(cube.contains(aabb.max));
		assert_eq!(cube.radius, 2.0);

		let point = DAabb3::new(DVec3::ONE, DVec3::ONE);
		assert_eq!(Cube::bounding(&point, 0.25).radius, 0.25);
	}
}
