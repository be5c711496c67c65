//! Flat point file writers.
//!
//! Datasets store positions relative to their coordinate offset; every writer
//! here adds the offset back so exported files live in source coordinates.
//!
//! | format | layout |
//! |--------|--------|
//! | ASCII  | `x y z r g b` per line, 12 significant digits |
//! | binary | offset `f64×3`, count `u32`, then `f32×3 + rgba` records relative to the offset |
//! | LAS    | LAS 1.2, point data format 2, no variable length records |

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use glam::DVec3;
use tracing::info;

use crate::codec;
use crate::error::{OctreeError, Result};
use crate::octree::DAabb3;
use crate::process::ProcessOctree;
use crate::runtime::RuntimeOctree;
use crate::types::{LidarPoint, Normal};

pub const LAS_HEADER_SIZE: u16 = 227;
pub const LAS_RECORD_SIZE: u16 = 26;
pub const LAS_POINT_FORMAT: u8 = 2;
pub const DEFAULT_LAS_SCALE: f64 = 0.001;

/// Byte position of the point count in a LAS 1.2 header.
const LAS_COUNT_POSITION: u64 = 107;
/// Byte position of the bounds block (max/min per axis).
const LAS_BOUNDS_POSITION: u64 = 179;
/// Byte position of the point count in a binary export.
const BINARY_COUNT_POSITION: u64 = 24;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExportFormat {
  Ascii,
  Binary,
  Las {
    /// Quantisation step per axis.
    scale: DVec3,
  },
}

impl ExportFormat {
  pub fn las() -> Self {
    Self::Las {
      scale: DVec3::splat(DEFAULT_LAS_SCALE),
    }
  }

  /// Guess the format from a file extension (`.las`, `.bin`, anything else is ASCII).
  pub fn from_path(path: &Path) -> Self {
    match path
      .extension()
      .and_then(|e| e.to_str())
      .map(str::to_ascii_lowercase)
      .as_deref()
    {
      Some("las") => Self::las(),
      Some("bin") => Self::Binary,
      _ => Self::Ascii,
    }
  }
}

/// Destination of exported points.
pub trait PointSink {
  fn write_point(&mut self, point: &LidarPoint) -> io::Result<()>;

  /// Patch headers and flush. Returns the number of points written.
  fn finish(self) -> io::Result<u64>;
}

/// Format `value` like C's `%.{digits}g`.
pub fn format_significant(value: f64, digits: usize) -> String {
  if !value.is_finite() {
    return value.to_string();
  }
  if value == 0.0 {
    return "0".to_string();
  }
  let precision = digits.max(1) - 1;
  // Rounding may bump the exponent, so take it from the rounded form.
  let scientific = format!("{value:.precision$e}");
  let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
  let exponent: i32 = exponent.parse().unwrap_or(0);
  if exponent < -4 || exponent >= digits.max(1) as i32 {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
  } else {
    let decimals = (precision as i32 - exponent).max(0) as usize;
    trim_fraction(&format!("{value:.decimals$}")).to_string()
  }
}

fn trim_fraction(text: &str) -> &str {
  if text.contains('.') {
    text.trim_end_matches('0').trim_end_matches('.')
  } else {
    text
  }
}

/// `x y z r g b` lines in source coordinates.
pub struct AsciiWriter<W: Write> {
  out: W,
  offset: DVec3,
  count: u64,
}

impl<W: Write> AsciiWriter<W> {
  pub fn new(out: W, offset: DVec3) -> Self {
    Self { out, offset, count: 0 }
  }

  fn write_fields(&mut self, point: &LidarPoint) -> io::Result<()> {
    let p = point.position + self.offset;
    let [r, g, b, _] = point.color.0;
    write!(
      self.out,
      "{} {} {} {r} {g} {b}",
      format_significant(p.x, 12),
      format_significant(p.y, 12),
      format_significant(p.z, 12),
    )
  }

  /// Write a point followed by its normal (`x y z r g b nx ny nz`).
  pub fn write_point_with_normal(&mut self, point: &LidarPoint, normal: Normal) -> io::Result<()> {
    self.write_fields(point)?;
    writeln!(
      self.out,
      " {} {} {}",
      format_significant(normal.x as f64, 8),
      format_significant(normal.y as f64, 8),
      format_significant(normal.z as f64, 8),
    )?;
    self.count += 1;
    Ok(())
  }
}

impl<W: Write> PointSink for AsciiWriter<W> {
  fn write_point(&mut self, point: &LidarPoint) -> io::Result<()> {
    self.write_fields(point)?;
    self.out.write_all(b"\n")?;
    self.count += 1;
    Ok(())
  }

  fn finish(mut self) -> io::Result<u64> {
    self.out.flush()?;
    Ok(self.count)
  }
}

/// Offset header followed by single precision records relative to it.
pub struct BinaryWriter<W: Write + Seek> {
  out: W,
  count: u64,
}

impl<W: Write + Seek> BinaryWriter<W> {
  pub fn new(mut out: W, offset: DVec3) -> io::Result<Self> {
    codec::write_dvec3(&mut out, offset)?;
    out.write_u32::<LittleEndian>(0)?;
    Ok(Self { out, count: 0 })
  }
}

impl<W: Write + Seek> PointSink for BinaryWriter<W> {
  fn write_point(&mut self, point: &LidarPoint) -> io::Result<()> {
    let p = point.position.as_vec3();
    self.out.write_f32::<LittleEndian>(p.x)?;
    self.out.write_f32::<LittleEndian>(p.y)?;
    self.out.write_f32::<LittleEndian>(p.z)?;
    self.out.write_all(&point.color.0)?;
    self.count += 1;
    Ok(())
  }

  fn finish(mut self) -> io::Result<u64> {
    let count = count_field(self.count)?;
    self.out.seek(SeekFrom::Start(BINARY_COUNT_POSITION))?;
    self.out.write_u32::<LittleEndian>(count)?;
    self.out.seek(SeekFrom::End(0))?;
    self.out.flush()?;
    Ok(self.count)
  }
}

fn count_field(count: u64) -> io::Result<u32> {
  u32::try_from(count).map_err(|_| {
    io::Error::new(
      io::ErrorKind::InvalidData,
      format!("{count} points do not fit a 32-bit point count"),
    )
  })
}

/// LAS 1.2 writer, point data format 2 (position, intensity, RGB).
///
/// Positions are quantised around `quantization_center` (dataset coordinates).
/// A point whose quantised coordinate does not fit an `i32` is rejected with
/// [`io::ErrorKind::InvalidData`].
pub struct LasWriter<W: Write + Seek> {
  out: W,
  offset: DVec3,
  center: DVec3,
  scale: DVec3,
  bounds: DAabb3,
  count: u64,
}

impl<W: Write + Seek> LasWriter<W> {
  pub fn new(mut out: W, offset: DVec3, quantization_center: DVec3, scale: DVec3) -> io::Result<Self> {
    if !scale.cmpgt(DVec3::ZERO).all() || !scale.is_finite() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("LAS scale must be positive, got {scale}"),
      ));
    }
    write_las_header(&mut out, quantization_center + offset, scale)?;
    Ok(Self {
      out,
      offset,
      center: quantization_center,
      scale,
      bounds: DAabb3::EMPTY,
      count: 0,
    })
  }
}

fn write_las_header<W: Write>(out: &mut W, offset: DVec3, scale: DVec3) -> io::Result<()> {
  out.write_all(b"LASF")?;
  // File source id, global encoding, project GUID.
  out.write_all(&[0; 2 + 2 + 16])?;
  out.write_all(&[1, 2])?;
  out.write_all(&[0; 32])?;
  let mut software = [0u8; 32];
  let name = concat!("lidar_octree ", env!("CARGO_PKG_VERSION")).as_bytes();
  software[..name.len().min(32)].copy_from_slice(&name[..name.len().min(32)]);
  out.write_all(&software)?;
  // Creation day and year.
  out.write_all(&[0; 4])?;
  out.write_u16::<LittleEndian>(LAS_HEADER_SIZE)?;
  out.write_u32::<LittleEndian>(LAS_HEADER_SIZE as u32)?;
  out.write_u32::<LittleEndian>(0)?;
  out.write_u8(LAS_POINT_FORMAT)?;
  out.write_u16::<LittleEndian>(LAS_RECORD_SIZE)?;
  // Point count and points by return, patched on finish.
  out.write_all(&[0; 4 + 5 * 4])?;
  codec::write_dvec3(out, scale)?;
  codec::write_dvec3(out, offset)?;
  out.write_all(&[0; 6 * 8])
}

impl<W: Write + Seek> PointSink for LasWriter<W> {
  fn write_point(&mut self, point: &LidarPoint) -> io::Result<()> {
    let q = ((point.position - self.center) / self.scale + 0.5).floor();
    let range = i32::MIN as f64..=i32::MAX as f64;
    if !(range.contains(&q.x) && range.contains(&q.y) && range.contains(&q.z)) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
          "point {} is too far from the LAS offset for scale {}",
          point.position + self.offset,
          self.scale
        ),
      ));
    }
    for value in q.to_array() {
      self.out.write_i32::<LittleEndian>(value as i32)?;
    }
    let [r, g, b, _] = point.color.0;
    let intensity = (r as u16 + g as u16 + b as u16 + 1) / 3;
    self.out.write_u16::<LittleEndian>(intensity)?;
    // Return bits, classification, scan angle, user data, point source id.
    self.out.write_all(&[0; 6])?;
    for channel in [r, g, b] {
      self.out.write_u16::<LittleEndian>(channel as u16 * 257)?;
    }
    self.bounds.add_point(point.position);
    self.count += 1;
    Ok(())
  }

  fn finish(mut self) -> io::Result<u64> {
    let count = count_field(self.count)?;
    self.out.seek(SeekFrom::Start(LAS_COUNT_POSITION))?;
    // Total count, then all points as first returns.
    self.out.write_u32::<LittleEndian>(count)?;
    self.out.write_u32::<LittleEndian>(count)?;
    if !self.bounds.is_empty() {
      let min = self.bounds.min + self.offset;
      let max = self.bounds.max + self.offset;
      self.out.seek(SeekFrom::Start(LAS_BOUNDS_POSITION))?;
      for axis in 0..3 {
        self.out.write_f64::<LittleEndian>(max[axis])?;
        self.out.write_f64::<LittleEndian>(min[axis])?;
      }
    }
    self.out.seek(SeekFrom::End(0))?;
    self.out.flush()?;
    Ok(self.count)
  }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
  let file = File::create(path).map_err(|source| OctreeError::Open {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(BufWriter::new(file))
}

fn write_error(path: &Path, source: io::Error) -> OctreeError {
  OctreeError::build(format!("writing {}", path.display()), source)
}

/// Feed the dataset's points into `sink`. The first write error stops
/// further writes and is returned once the traversal ends.
fn drain<S: PointSink>(octree: &ProcessOctree, bounds: Option<&DAabb3>, mut sink: S) -> Result<io::Result<u64>> {
  let mut failure = None;
  let mut visit = |point: &LidarPoint| {
    if failure.is_none() {
      if let Err(err) = sink.write_point(point) {
        failure = Some(err);
      }
    }
  };
  match bounds {
    Some(bounds) => octree.process_points_in_box(bounds, &mut visit)?,
    None => octree.process_points(&mut visit)?,
  };
  Ok(match failure {
    Some(err) => Err(err),
    None => sink.finish(),
  })
}

/// Export every point of `octree`, or only those inside `bounds` (given in
/// source coordinates), to `path`. Returns the number of points written.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn export_dataset(
  octree: &ProcessOctree,
  path: impl AsRef<Path>,
  format: ExportFormat,
  bounds: Option<&DAabb3>,
) -> Result<u64> {
  let path = path.as_ref();
  let offset = octree.offset();
  let local_bounds = bounds.map(|b| DAabb3::new(b.min - offset, b.max - offset));
  let out = create(path)?;
  let written = match format {
    ExportFormat::Ascii => drain(octree, local_bounds.as_ref(), AsciiWriter::new(out, offset))?,
    ExportFormat::Binary => {
      let writer = BinaryWriter::new(out, offset).map_err(|e| write_error(path, e))?;
      drain(octree, local_bounds.as_ref(), writer)?
    }
    ExportFormat::Las { scale } => {
      let writer = LasWriter::new(out, offset, octree.domain().center, scale).map_err(|e| write_error(path, e))?;
      drain(octree, local_bounds.as_ref(), writer)?
    }
  };
  let count = written.map_err(|e| write_error(path, e))?;
  info!("exported {count} points to {}", path.display());
  Ok(count)
}

/// Write the runtime's selected resident points as ASCII in source
/// coordinates, with `nx ny nz` appended when `with_normals` is set.
pub fn save_selection(runtime: &RuntimeOctree, path: impl AsRef<Path>, with_normals: bool) -> Result<u64> {
  let path = path.as_ref();
  if with_normals && !runtime.has_normals() {
    return Err(OctreeError::MissingNormals(runtime.paths().root().to_path_buf()));
  }
  let mut writer = AsciiWriter::new(create(path)?, runtime.offset());
  let mut failure = None;
  runtime.process_selected_points(|point, normal| {
    if failure.is_some() {
      return;
    }
    let result = match normal.filter(|_| with_normals) {
      Some(normal) => writer.write_point_with_normal(point, normal),
      None => writer.write_point(point),
    };
    if let Err(err) = result {
      failure = Some(err);
    }
  });
  if let Some(err) = failure {
    return Err(write_error(path, err));
  }
  let count = writer.finish().map_err(|e| write_error(path, e))?;
  info!("saved {count} selected points to {}", path.display());
  Ok(count)
}

#[cfg(test)]
#[path = "export_test.rs"]
mod export_test;
