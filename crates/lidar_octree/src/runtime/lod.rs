//! View-dependent level of detail.
//!
//! A node is refined when its detail size, projected to the screen, is
//! larger than the quality target:
//!
//! ```text
//!   projected = detail_size * projection_scale / distance(eye, domain)
//!   refine    = projected * focus_falloff > 2^-render_quality
//! ```
//!
//! `projection_scale` is the number of pixels a unit-length segment covers
//! at unit distance. With a focus point set, nodes outside the focus sphere
//! are weighted down by `(focus_radius / distance)^weight`, so the budget
//! goes to the region around the interaction point.
//!
//! All positions are in dataset coordinates (the offset already removed).

use glam::{DMat4, DVec3, DVec4};

use crate::octree::Cube;

/// Six normalized clipping planes, `dot(plane.xyz, p) + plane.w >= 0` inside.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
	pub planes: [DVec4; 6],
}

impl Frustum {
	/// Extract the planes of a right-handed projection with `[0, 1]` depth.
	pub fn from_view_projection(m: DMat4) -> Self {
		let r0 = m.row(0);
		let r1 = m.row(1);
		let r2 = m.row(2);
		let r3 = m.row(3);
		let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
			let length = plane.truncate().length();
			if length > 0.0 {
				plane / length
			} else {
				plane
			}
		});
		Self { planes }
	}

	/// Conservative cube test using the positive vertex of each plane.
	pub fn intersects_cube(&self, cube: &Cube) -> bool {
		let min = cube.min();
		let max = cube.max();
		self.planes.iter().all(|plane| {
			let positive = DVec3::new(
				if plane.x >= 0.0 { max.x } else { min.x },
				if plane.y >= 0.0 { max.y } else { min.y },
				if plane.z >= 0.0 { max.z } else { min.z },
			);
			plane.truncate().dot(positive) + plane.w >= 0.0
		})
	}
}

/// Interaction point that attracts detail.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Focus {
	pub center: DVec3,
	pub radius: f64,
}

/// Everything one render pass needs to know about the viewer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewState {
	pub view_projection: DMat4,
	pub eye: DVec3,
	pub projection_scale: f64,
	pub focus: Option<Focus>,
}

impl ViewState {
	/// Build from separate view and perspective projection matrices.
	pub fn new(view: DMat4, projection: DMat4, viewport_height: f64) -> Self {
		let eye = view.inverse().w_axis.truncate();
		Self {
			view_projection: projection * view,
			eye,
			projection_scale: 0.5 * viewport_height * projection.y_axis.y.abs(),
			focus: None,
		}
	}

	/// Square viewport looking from `eye` at `target`, Z up.
	pub fn looking_at(eye: DVec3, target: DVec3, fov_y: f64, viewport_height: f64) -> Self {
		let forward = (target - eye).normalize_or_zero();
		let up = if forward.cross(DVec3::Z).length_squared() < 1e-12 {
			DVec3::Y
		} else {
			DVec3::Z
		};
		let view = DMat4::look_at_rh(eye, target, up);
		let projection = DMat4::perspective_rh(fov_y, 1.0, 1e-3, 1e6);
		Self::new(view, projection, viewport_height)
	}

	pub fn with_focus(mut self, center: DVec3, radius: f64) -> Self {
		self.focus = Some(Focus { center, radius });
		self
	}

	#[inline]
	pub fn frustum(&self) -> Frustum {
		Frustum::from_view_projection(self.view_projection)
	}
}

/// Screen-space target for `render_quality` (pixels of point spacing).
#[inline]
pub fn quality_threshold(render_quality: f64) -> f64 {
	(-render_quality).exp2()
}

/// Projected detail of a node, weighted by the focus+context falloff.
pub fn projected_detail(view: &ViewState, domain: &Cube, detail_size: f64, focus_weight: f64) -> f64 {
	if detail_size <= 0.0 {
		return 0.0;
	}
	let distance = domain.distance_squared(view.eye).sqrt();
	if distance <= 0.0 {
		return f64::INFINITY;
	}
	let mut projected = detail_size * view.projection_scale / distance;
	if let Some(focus) = view.focus {
		let focus_distance = domain.distance_squared(focus.center).sqrt();
		if focus_weight > 0.0 && focus_distance > focus.radius {
			projected *= (focus.radius / focus_distance).powf(focus_weight);
		}
	}
	projected
}
