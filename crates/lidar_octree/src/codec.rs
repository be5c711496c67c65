//! Little-endian encodings of point records, index headers, node records,
//! normals, and the coordinate offset.
//!
//! ```text
//! Index header (40 bytes)
//!   u32 record_size | f64 cx | f64 cy | f64 cz | f64 radius | u32 max_points
//! Node record (28 bytes)
//!   u64 children_offset (0 = leaf) | f64 detail_size | u64 data_offset | u32 num_points
//! Point record (16 or 28 bytes)
//!   f32|f64 x, y, z | u8 r, g, b, a
//! ```
//!
//! `children_offset` is the byte offset of the contiguous block of 8 child
//! records inside `Index`. `data_offset` counts point records, not bytes.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{DVec3, Vec3};

use crate::types::{LidarPoint, Normal, PointFormat, Rgba};

type LE = LittleEndian;

// =============================================================================
// Points
// =============================================================================

#[inline]
pub fn write_point<W: Write>(writer: &mut W, point: &LidarPoint, format: PointFormat) -> io::Result<()> {
  match format {
    PointFormat::F32 => {
      let p = point.position.as_vec3();
      writer.write_f32::<LE>(p.x)?;
      writer.write_f32::<LE>(p.y)?;
      writer.write_f32::<LE>(p.z)?;
    }
    PointFormat::F64 => {
      writer.write_f64::<LE>(point.position.x)?;
      writer.write_f64::<LE>(point.position.y)?;
      writer.write_f64::<LE>(point.position.z)?;
    }
  }
  writer.write_all(&point.color.0)
}

#[inline]
pub fn read_point<R: Read>(reader: &mut R, format: PointFormat) -> io::Result<LidarPoint> {
  let position = match format {
    PointFormat::F32 => DVec3::new(
      reader.read_f32::<LE>()? as f64,
      reader.read_f32::<LE>()? as f64,
      reader.read_f32::<LE>()? as f64,
    ),
    PointFormat::F64 => DVec3::new(
      reader.read_f64::<LE>()?,
      reader.read_f64::<LE>()?,
      reader.read_f64::<LE>()?,
    ),
  };
  let mut color = [0u8; 4];
  reader.read_exact(&mut color)?;
  Ok(LidarPoint::new(position, Rgba(color)))
}

/// Append encoded records for `points` to `out`.
pub fn encode_points(points: &[LidarPoint], format: PointFormat, out: &mut Vec<u8>) {
  out.reserve(points.len() * format.record_size() as usize);
  for point in points {
    // Writing into a Vec cannot fail.
    let _ = write_point(out, point, format);
  }
}

/// Decode every record in `bytes`.
///
/// Fails with `UnexpectedEof` if the buffer ends inside a record.
pub fn decode_points(bytes: &[u8], format: PointFormat) -> io::Result<Vec<LidarPoint>> {
  let record_size = format.record_size() as usize;
  if bytes.len() % record_size != 0 {
    return Err(io::Error::new(
      io::ErrorKind::UnexpectedEof,
      format!(
        "{} bytes is not a whole number of {}-byte point records",
        bytes.len(),
        record_size
      ),
    ));
  }
  let mut reader = bytes;
  let mut points = Vec::with_capacity(bytes.len() / record_size);
  while !reader.is_empty() {
    points.push(read_point(&mut reader, format)?);
  }
  Ok(points)
}

// =============================================================================
// Index
// =============================================================================

/// Header at the start of the `Index` file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexHeader {
  pub point_format: PointFormat,
  pub center: DVec3,
  pub radius: f64,
  pub max_points_per_node: u32,
}

impl IndexHeader {
  pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    writer.write_u32::<LE>(self.point_format.record_size())?;
    write_dvec3(writer, self.center)?;
    writer.write_f64::<LE>(self.radius)?;
    writer.write_u32::<LE>(self.max_points_per_node)
  }

  /// Decode a header. An unknown record size is reported as `InvalidData`.
  pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
    let record_size = reader.read_u32::<LE>()?;
    let point_format = PointFormat::from_record_size(record_size).ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported point record size {record_size}"),
      )
    })?;
    let center = read_dvec3(reader)?;
    let radius = reader.read_f64::<LE>()?;
    let max_points_per_node = reader.read_u32::<LE>()?;
    Ok(Self {
      point_format,
      center,
      radius,
      max_points_per_node,
    })
  }
}

/// One fixed-size node record in the `Index` file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeRecord {
  /// Byte offset of the 8-child block, 0 for leaves.
  pub children_offset: u64,
  pub detail_size: f64,
  /// Offset of the first point record, in records.
  pub data_offset: u64,
  pub num_points: u32,
}

impl NodeRecord {
  #[inline]
  pub fn is_leaf(&self) -> bool {
    self.children_offset == 0
  }

  pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    writer.write_u64::<LE>(self.children_offset)?;
    writer.write_f64::<LE>(self.detail_size)?;
    writer.write_u64::<LE>(self.data_offset)?;
    writer.write_u32::<LE>(self.num_points)
  }

  pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
    Ok(Self {
      children_offset: reader.read_u64::<LE>()?,
      detail_size: reader.read_f64::<LE>()?,
      data_offset: reader.read_u64::<LE>()?,
      num_points: reader.read_u32::<LE>()?,
    })
  }
}

// =============================================================================
// Normals and offset
// =============================================================================

#[inline]
pub fn write_normal<W: Write>(writer: &mut W, normal: Normal) -> io::Result<()> {
  writer.write_f32::<LE>(normal.x)?;
  writer.write_f32::<LE>(normal.y)?;
  writer.write_f32::<LE>(normal.z)
}

#[inline]
pub fn read_normal<R: Read>(reader: &mut R) -> io::Result<Normal> {
  Ok(Vec3::new(
    reader.read_f32::<LE>()?,
    reader.read_f32::<LE>()?,
    reader.read_f32::<LE>()?,
  ))
}

#[inline]
pub fn write_dvec3<W: Write>(writer: &mut W, v: DVec3) -> io::Result<()> {
  writer.write_f64::<LE>(v.x)?;
  writer.write_f64::<LE>(v.y)?;
  writer.write_f64::<LE>(v.z)
}

#[inline]
pub fn read_dvec3<R: Read>(reader: &mut R) -> io::Result<DVec3> {
  Ok(DVec3::new(
    reader.read_f64::<LE>()?,
    reader.read_f64::<LE>()?,
    reader.read_f64::<LE>()?,
  ))
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
