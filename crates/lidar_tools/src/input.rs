//! Point producers for the preprocessor.
//!
//! Each reader calls a sink with the raw position (source coordinates) and
//! color channels in `[0, 255]` of every point, the shape
//! [`PointAccumulator::add_point`] expects.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use glam::DVec3;
use lidar_octree::{PointAccumulator, ProcessOctree};
use tracing::{info, warn};

const WHITE: [f32; 4] = [255.0; 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
	/// `x y z [r g b]` text, whitespace or comma separated.
	Ascii,
	/// Offset header, `u32` count, `f32×3 + rgba` records (the binary export layout).
	Binary,
	/// A finished dataset directory.
	Dataset,
}

impl InputFormat {
	pub fn detect(path: &Path) -> Self {
		if path.is_dir() {
			return Self::Dataset;
		}
		match path.extension().and_then(|e| e.to_str()) {
			Some(ext) if ext.eq_ignore_ascii_case("bin") => Self::Binary,
			_ => Self::Ascii,
		}
	}
}

/// Read every point of `path` into `sink`. Returns the number of points read.
///
/// `cache_bytes` sizes the node cache when re-ingesting a dataset.
pub fn read_points<F>(path: &Path, format: InputFormat, cache_bytes: usize, sink: F) -> Result<u64>
where
	F: FnMut(DVec3, [f32; 4]) -> lidar_octree::Result<()>,
{
	let open = || File::open(path).with_context(|| format!("cannot open {}", path.display()));
	let count = match format {
		InputFormat::Ascii => read_ascii(BufReader::new(open()?), sink),
		InputFormat::Binary => read_binary(BufReader::new(open()?), sink),
		InputFormat::Dataset => read_dataset(path, cache_bytes, sink),
	}
	.with_context(|| format!("reading {}", path.display()))?;
	info!("read {count} points from {}", path.display());
	Ok(count)
}

/// Feed every point of `path` into `accumulator`.
pub fn accumulate(path: &Path, format: InputFormat, cache_bytes: usize, accumulator: &mut PointAccumulator) -> Result<u64> {
	read_points(path, format, cache_bytes, |position, color| accumulator.add_point(position, color))
}

pub fn read_ascii<R, F>(reader: R, mut sink: F) -> Result<u64>
where
	R: BufRead,
	F: FnMut(DVec3, [f32; 4]) -> lidar_octree::Result<()>,
{
	let mut count = 0;
	let mut skipped = 0u64;
	let mut values = Vec::with_capacity(8);
	for (number, line) in reader.lines().enumerate() {
		let line = line.with_context(|| format!("line {}", number + 1))?;
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		values.clear();
		let parsed = line
			.split(|c: char| c.is_whitespace() || c == ',')
			.filter(|field| !field.is_empty())
			.try_for_each(|field| field.parse::<f64>().map(|v| values.push(v)));
		if parsed.is_err() || values.len() < 3 {
			skipped += 1;
			continue;
		}
		let position = DVec3::new(values[0], values[1], values[2]);
		let color = match values.get(3..6) {
			Some(&[r, g, b]) => [r as f32, g as f32, b as f32, 255.0],
			_ => WHITE,
		};
		sink(position, color)?;
		count += 1;
	}
	if skipped > 0 {
		warn!(skipped, "ignored lines that are not `x y z [r g b]` records");
	}
	Ok(count)
}

pub fn read_binary<R, F>(mut reader: R, mut sink: F) -> Result<u64>
where
	R: Read,
	F: FnMut(DVec3, [f32; 4]) -> lidar_octree::Result<()>,
{
	let mut header = || -> std::io::Result<(DVec3, u32)> {
		let offset = DVec3::new(
			reader.read_f64::<LittleEndian>()?,
			reader.read_f64::<LittleEndian>()?,
			reader.read_f64::<LittleEndian>()?,
		);
		Ok((offset, reader.read_u32::<LittleEndian>()?))
	};
	let (offset, count) = header().context("truncated header")?;
	for index in 0..count {
		let mut record = || -> std::io::Result<(DVec3, [u8; 4])> {
			let x = reader.read_f32::<LittleEndian>()?;
			let y = reader.read_f32::<LittleEndian>()?;
			let z = reader.read_f32::<LittleEndian>()?;
			let mut color = [0; 4];
			reader.read_exact(&mut color)?;
			Ok((DVec3::new(x as f64, y as f64, z as f64), color))
		};
		let Ok((position, color)) = record() else {
			bail!("file ends after {index} of {count} points");
		};
		sink(position + offset, color.map(f32::from))?;
	}
	Ok(count as u64)
}

/// Visit every leaf point of a finished dataset, offset added back.
pub fn read_dataset<F>(dir: &Path, cache_bytes: usize, mut sink: F) -> Result<u64>
where
	F: FnMut(DVec3, [f32; 4]) -> lidar_octree::Result<()>,
{
	let octree = ProcessOctree::open(dir, cache_bytes)?;
	let offset = octree.offset();
	let mut failure = None;
	let count = octree.process_points(|point| {
		if failure.is_none() {
			if let Err(err) = sink(point.position + offset, point.color.0.map(f32::from)) {
				failure = Some(err);
			}
		}
	})?;
	if let Some(err) = failure {
		return Err(err.into());
	}
	Ok(count)
}
