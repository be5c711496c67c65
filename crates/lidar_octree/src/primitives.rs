//! Geometric primitives fitted to selected points, and their file format.
//!
//! A primitive file is a 40-byte text header followed by records until end
//! of file, all little-endian:
//!
//! ```text
//! type:i32 num_points:u64 rms:f64 label_len:u32 label:utf8 <shape fields>
//!
//! 0 point     position:f64×3
//! 1 sphere    center:f64×3 radius:f64
//! 2 line      center:f64×3 axis:f64×3 length:f64 extents:f64×2
//! 3 cylinder  <line fields> radius:f64 num_lines:i32×2
//! 4 plane     center:f64×3 normal:f64×3 axes:2×f64×3 extents:2×f64×2 num_lines:i32×2
//! ```
//!
//! Positions are written in source coordinates: the dataset offset is added
//! on save and subtracted on load. Directions and sizes are not translated.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::DVec3;
use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::codec::{read_dvec3, write_dvec3};
use crate::error::{OctreeError, Result};
use crate::plane_fit::PlaneFitter;
use crate::runtime::RuntimeOctree;

pub const PRIMITIVE_FILE_HEADER: [u8; 40] = *b"lidar_octree primitive file v1.3      \n\0";

/// Grid lines drawn along the longer side of a plane patch.
const PLANE_GRID_LINES: f64 = 10.0;
/// Margin added around fitted plane extents, relative to the larger side.
const PLANE_MARGIN: f64 = 0.1;
/// Longest label accepted when loading.
const MAX_LABEL_LEN: u32 = 1 << 16;

/// Segment on an infinite line: points `center + axis * t` for `t` in `extents`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
  pub center: DVec3,
  /// Unit direction.
  pub axis: DVec3,
  pub length: f64,
  pub extents: [f64; 2],
}

impl Segment {
  pub fn closest_point(&self, point: DVec3) -> DVec3 {
    let t = (point - self.center)
      .dot(self.axis)
      .clamp(self.extents[0], self.extents[1]);
    self.center + self.axis * t
  }
}

/// Rectangular patch of a plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlanePatch {
  pub center: DVec3,
  /// Unit normal; `axes[0] × axes[1] == normal`.
  pub normal: DVec3,
  pub axes: [DVec3; 2],
  /// Extent along each axis, relative to `center`.
  pub extents: [[f64; 2]; 2],
  /// Grid lines drawn along each axis.
  pub num_lines: [i32; 2],
}

impl PlanePatch {
  /// Signed distance of `point` from the infinite plane.
  #[inline]
  pub fn signed_distance(&self, point: DVec3) -> f64 {
    (point - self.center).dot(self.normal)
  }

  pub fn closest_point(&self, point: DVec3) -> DVec3 {
    let d = point - self.center;
    let mut closest = self.center;
    for (axis, extent) in self.axes.iter().zip(&self.extents) {
      closest += *axis * d.dot(*axis).clamp(extent[0], extent[1]);
    }
    closest
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
  Point(DVec3),
  Sphere { center: DVec3, radius: f64 },
  Line(Segment),
  Cylinder { axis: Segment, radius: f64, num_lines: [i32; 2] },
  Plane(PlanePatch),
}

impl Shape {
  pub fn type_tag(&self) -> i32 {
    match self {
      Self::Point(_) => 0,
      Self::Sphere { .. } => 1,
      Self::Line(_) => 2,
      Self::Cylinder { .. } => 3,
      Self::Plane(_) => 4,
    }
  }

  fn translated(mut self, delta: DVec3) -> Self {
    match &mut self {
      Self::Point(position) => *position += delta,
      Self::Sphere { center, .. } => *center += delta,
      Self::Line(segment) | Self::Cylinder { axis: segment, .. } => segment.center += delta,
      Self::Plane(patch) => patch.center += delta,
    }
    self
  }
}

/// A fitted primitive with its fit quality.
#[derive(Clone, Debug, PartialEq)]
pub struct Primitive {
  pub label: String,
  /// Points the primitive was fitted to.
  pub num_points: u64,
  /// Root mean square residual of the fit.
  pub rms: f64,
  pub shape: Shape,
}

impl Primitive {
  pub fn new(label: impl Into<String>, num_points: u64, rms: f64, shape: Shape) -> Self {
    Self {
      label: label.into(),
      num_points,
      rms,
      shape,
    }
  }

  /// Distance from `point` to the primitive's surface.
  pub fn distance(&self, point: DVec3) -> f64 {
    match &self.shape {
      Shape::Point(position) => point.distance(*position),
      Shape::Sphere { center, radius } => (point.distance(*center) - radius).abs(),
      Shape::Line(segment) => point.distance(segment.closest_point(point)),
      Shape::Cylinder { axis, radius, .. } => (point.distance(axis.closest_point(point)) - radius).abs(),
      Shape::Plane(patch) => point.distance(patch.closest_point(point)),
    }
  }

  /// Fit a plane patch to the selected points of the finest resident level.
  ///
  /// The normal points upwards (`z >= 0`). Extents cover the points plus a
  /// margin. `None` with fewer than 3 selected points.
  pub fn plane_from_selection(runtime: &RuntimeOctree, label: impl Into<String>) -> Option<Self> {
    let mut fitter = PlaneFitter::new();
    runtime.process_selected_points(|point, _| fitter.add_point(point.position));
    let fitted = fitter.fit()?;
    let normal = if fitted.normal.z < 0.0 { -fitted.normal } else { fitted.normal };
    let axes = [fitted.axes[0], normal.cross(fitted.axes[0])];

    let mut extents = [[f64::INFINITY, f64::NEG_INFINITY]; 2];
    runtime.process_selected_points(|point, _| {
      let d = point.position - fitted.centroid;
      for (extent, axis) in extents.iter_mut().zip(&axes) {
        let t = d.dot(*axis);
        extent[0] = extent[0].min(t);
        extent[1] = extent[1].max(t);
      }
    });
    let sizes = extents.map(|[min, max]| max - min);
    let margin = sizes[0].max(sizes[1]) * PLANE_MARGIN;
    let extents = extents.map(|[min, max]| [min - margin, max + margin]);

    Some(Self::new(
      label,
      fitter.len() as u64,
      fitted.rms,
      Shape::Plane(PlanePatch {
        center: fitted.centroid,
        normal,
        axes,
        extents,
        num_lines: grid_lines(extents),
      }),
    ))
  }

  /// Centroid of the selected points. The fit residual is the root mean
  /// square distance from it.
  pub fn point_from_selection(runtime: &RuntimeOctree, label: impl Into<String>) -> Option<Self> {
    let mut fitter = PlaneFitter::new();
    runtime.process_selected_points(|point, _| fitter.add_point(point.position));
    let centroid = fitter.centroid()?;
    let mut sum_squared = 0.0;
    runtime.process_selected_points(|point, _| sum_squared += point.position.distance_squared(centroid));
    let count = fitter.len();
    Some(Self::new(
      label,
      count as u64,
      (sum_squared / count as f64).sqrt(),
      Shape::Point(centroid),
    ))
  }

  /// Intersection point of three plane primitives; `None` unless all three
  /// are planes with linearly independent normals.
  pub fn point_from_planes(planes: [&Primitive; 3], label: impl Into<String>) -> Option<Self> {
    let mut patches = [None; 3];
    for (slot, primitive) in patches.iter_mut().zip(planes) {
      if let Shape::Plane(patch) = primitive.shape {
        *slot = Some(patch);
      }
    }
    let [Some(a), Some(b), Some(c)] = patches else {
      return None;
    };
    let position = intersect_planes([&a, &b, &c])?;
    Some(Self::new(label, 0, 0.0, Shape::Point(position)))
  }

  /// Intersection point of a plane and a line (or cylinder axis).
  pub fn point_from_plane_and_line(plane: &Primitive, line: &Primitive, label: impl Into<String>) -> Option<Self> {
    let Shape::Plane(patch) = &plane.shape else {
      return None;
    };
    let segment = match &line.shape {
      Shape::Line(segment) | Shape::Cylinder { axis: segment, .. } => segment,
      _ => return None,
    };
    let position = intersect_plane_line(patch, segment)?;
    Some(Self::new(label, 0, 0.0, Shape::Point(position)))
  }
}

/// Grid line counts: fixed along the longer side, proportional along the other.
fn grid_lines(extents: [[f64; 2]; 2]) -> [i32; 2] {
  let [w, h] = extents.map(|[min, max]| max - min);
  if w <= 0.0 || h <= 0.0 {
    return [PLANE_GRID_LINES as i32; 2];
  }
  let lines = |short: f64, long: f64| ((PLANE_GRID_LINES * short / long + 0.5).floor() as i32).max(1);
  if w >= h {
    [PLANE_GRID_LINES as i32, lines(h, w)]
  } else {
    [lines(w, h), PLANE_GRID_LINES as i32]
  }
}

fn to_vector(v: DVec3) -> Vector3<f64> {
  Vector3::new(v.x, v.y, v.z)
}

pub fn intersect_planes(planes: [&PlanePatch; 3]) -> Option<DVec3> {
  let normals = planes.map(|p| to_vector(p.normal).transpose());
  let matrix = Matrix3::from_rows(&normals);
  let rhs = Vector3::from(planes.map(|p| p.normal.dot(p.center)));
  // Near-parallel planes give a meaningless intersection.
  if matrix.determinant().abs() < 1e-9 {
    return None;
  }
  let solution = matrix.lu().solve(&rhs)?;
  Some(DVec3::new(solution.x, solution.y, solution.z))
}

pub fn intersect_plane_line(plane: &PlanePatch, line: &Segment) -> Option<DVec3> {
  let denominator = plane.normal.dot(line.axis);
  if denominator.abs() < 1e-9 {
    return None;
  }
  let t = plane.normal.dot(plane.center - line.center) / denominator;
  Some(line.center + line.axis * t)
}

/// Index of the primitive closest to `point`, if any lies within `max_distance`.
pub fn pick_primitive(primitives: &[Primitive], point: DVec3, max_distance: f64) -> Option<usize> {
  primitives
    .iter()
    .enumerate()
    .map(|(index, primitive)| (index, primitive.distance(point)))
    .filter(|&(_, distance)| distance <= max_distance)
    .min_by(|a, b| a.1.total_cmp(&b.1))
    .map(|(index, _)| index)
}

// =============================================================================
// File format
// =============================================================================

fn write_segment<W: Write>(out: &mut W, segment: &Segment) -> io::Result<()> {
  write_dvec3(out, segment.center)?;
  write_dvec3(out, segment.axis)?;
  out.write_f64::<LittleEndian>(segment.length)?;
  segment
    .extents
    .iter()
    .try_for_each(|&e| out.write_f64::<LittleEndian>(e))
}

fn read_segment<R: Read>(input: &mut R) -> io::Result<Segment> {
  Ok(Segment {
    center: read_dvec3(input)?,
    axis: read_dvec3(input)?,
    length: input.read_f64::<LittleEndian>()?,
    extents: [input.read_f64::<LittleEndian>()?, input.read_f64::<LittleEndian>()?],
  })
}

fn write_num_lines<W: Write>(out: &mut W, num_lines: [i32; 2]) -> io::Result<()> {
  out.write_i32::<LittleEndian>(num_lines[0])?;
  out.write_i32::<LittleEndian>(num_lines[1])
}

fn read_num_lines<R: Read>(input: &mut R) -> io::Result<[i32; 2]> {
  Ok([input.read_i32::<LittleEndian>()?, input.read_i32::<LittleEndian>()?])
}

pub fn write_primitive<W: Write>(out: &mut W, primitive: &Primitive) -> io::Result<()> {
  out.write_i32::<LittleEndian>(primitive.shape.type_tag())?;
  out.write_u64::<LittleEndian>(primitive.num_points)?;
  out.write_f64::<LittleEndian>(primitive.rms)?;
  let label = primitive.label.as_bytes();
  let label_len = u32::try_from(label.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "label too long"))?;
  out.write_u32::<LittleEndian>(label_len)?;
  out.write_all(label)?;
  match &primitive.shape {
    Shape::Point(position) => write_dvec3(out, *position),
    Shape::Sphere { center, radius } => {
      write_dvec3(out, *center)?;
      out.write_f64::<LittleEndian>(*radius)
    }
    Shape::Line(segment) => write_segment(out, segment),
    Shape::Cylinder { axis, radius, num_lines } => {
      write_segment(out, axis)?;
      out.write_f64::<LittleEndian>(*radius)?;
      write_num_lines(out, *num_lines)
    }
    Shape::Plane(patch) => {
      write_dvec3(out, patch.center)?;
      write_dvec3(out, patch.normal)?;
      for axis in patch.axes {
        write_dvec3(out, axis)?;
      }
      for extent in patch.extents.iter().flatten() {
        out.write_f64::<LittleEndian>(*extent)?;
      }
      write_num_lines(out, patch.num_lines)
    }
  }
}

pub fn read_primitive<R: Read>(input: &mut R) -> io::Result<Primitive> {
  let invalid = |message: String| io::Error::new(io::ErrorKind::InvalidData, message);
  let type_tag = input.read_i32::<LittleEndian>()?;
  let num_points = input.read_u64::<LittleEndian>()?;
  let rms = input.read_f64::<LittleEndian>()?;
  let label_len = input.read_u32::<LittleEndian>()?;
  if label_len > MAX_LABEL_LEN {
    return Err(invalid(format!("label of {label_len} bytes")));
  }
  let mut label = vec![0; label_len as usize];
  input.read_exact(&mut label)?;
  let label = String::from_utf8(label).map_err(|_| invalid("label is not UTF-8".into()))?;
  let shape = match type_tag {
    0 => Shape::Point(read_dvec3(input)?),
    1 => Shape::Sphere {
      center: read_dvec3(input)?,
      radius: input.read_f64::<LittleEndian>()?,
    },
    2 => Shape::Line(read_segment(input)?),
    3 => Shape::Cylinder {
      axis: read_segment(input)?,
      radius: input.read_f64::<LittleEndian>()?,
      num_lines: read_num_lines(input)?,
    },
    4 => {
      let center = read_dvec3(input)?;
      let normal = read_dvec3(input)?;
      let axes = [read_dvec3(input)?, read_dvec3(input)?];
      let mut extents = [[0.0; 2]; 2];
      for extent in extents.iter_mut().flatten() {
        *extent = input.read_f64::<LittleEndian>()?;
      }
      Shape::Plane(PlanePatch {
        center,
        normal,
        axes,
        extents,
        num_lines: read_num_lines(input)?,
      })
    }
    other => return Err(invalid(format!("unsupported primitive type {other}"))),
  };
  Ok(Primitive {
    label,
    num_points,
    rms,
    shape,
  })
}

/// Write `primitives` (dataset coordinates) to `path` in source coordinates.
pub fn save_primitives(path: impl AsRef<Path>, primitives: &[Primitive], offset: DVec3) -> Result<()> {
  let path = path.as_ref();
  let file = File::create(path).map_err(|source| OctreeError::Open {
    path: path.to_path_buf(),
    source,
  })?;
  let mut out = BufWriter::new(file);
  let write = |out: &mut BufWriter<File>| -> io::Result<()> {
    out.write_all(&PRIMITIVE_FILE_HEADER)?;
    for primitive in primitives {
      let translated = Primitive {
        shape: primitive.shape.translated(offset),
        ..primitive.clone()
      };
      write_primitive(out, &translated)?;
    }
    out.flush()
  };
  write(&mut out).map_err(|e| OctreeError::build(format!("writing {}", path.display()), e))?;
  debug!("saved {} primitives to {}", primitives.len(), path.display());
  Ok(())
}

/// Read every primitive in `path`, translated into dataset coordinates.
pub fn load_primitives(path: impl AsRef<Path>, offset: DVec3) -> Result<Vec<Primitive>> {
  let path = path.as_ref();
  let file = File::open(path).map_err(|source| OctreeError::Open {
    path: path.to_path_buf(),
    source,
  })?;
  let invalid = |reason: String| OctreeError::PrimitiveFile {
    path: path.to_path_buf(),
    reason,
  };
  let mut input = BufReader::new(file);
  let mut header = [0u8; PRIMITIVE_FILE_HEADER.len()];
  input
    .read_exact(&mut header)
    .map_err(|e| invalid(format!("missing header: {e}")))?;
  if header != PRIMITIVE_FILE_HEADER {
    return Err(invalid("unrecognized header".into()));
  }
  let mut primitives = Vec::new();
  loop {
    let at_end = input
      .fill_buf()
      .map_err(|e| invalid(e.to_string()))?
      .is_empty();
    if at_end {
      break;
    }
    let mut primitive =
      read_primitive(&mut input).map_err(|e| invalid(format!("record {}: {e}", primitives.len())))?;
    primitive.shape = primitive.shape.translated(-offset);
    primitives.push(primitive);
  }
  Ok(primitives)
}

#[cfg(test)]
#[path = "primitives_test.rs"]
mod primitives_test;
