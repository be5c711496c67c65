//! Write a dataset, or a box of it, back out as a flat point file.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use glam::DVec3;
use lidar_octree::export::{export_dataset, ExportFormat};
use lidar_octree::{DAabb3, ProcessOctree};
use lidar_tools::config::Settings;
use lidar_tools::{init_logging, mib};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
	Ascii,
	Binary,
	Las,
}

#[derive(Parser, Debug)]
#[command(name = "lidar_export")]
#[command(about = "Exports dataset points as ASCII, binary, or LAS")]
struct Args {
	/// Dataset directory.
	dataset: PathBuf,

	/// Output file.
	output: PathBuf,

	/// Output format (default: from the output extension).
	#[arg(short, long, value_enum)]
	format: Option<FormatArg>,

	/// Settings TOML file; flags override its `[exporter]` values.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// LAS quantisation step.
	#[arg(long)]
	scale: Option<f64>,

	/// Only export points inside this box, in source coordinates.
	#[arg(
		long = "box",
		num_args = 6,
		allow_negative_numbers = true,
		value_names = ["MIN_X", "MIN_Y", "MIN_Z", "MAX_X", "MAX_Y", "MAX_Z"]
	)]
	bounds: Option<Vec<f64>>,

	/// Node cache size in MiB.
	#[arg(short, long)]
	memory_mb: Option<usize>,

	#[arg(short, long)]
	verbose: bool,
}

fn main() -> Result<()> {
	let args = Args::parse();
	init_logging(args.verbose);

	let settings = Settings::load_or_default(args.config.as_deref())?.exporter;
	let scale = args.scale.unwrap_or(settings.las_scale);
	let format = match args.format {
		Some(FormatArg::Ascii) => ExportFormat::Ascii,
		Some(FormatArg::Binary) => ExportFormat::Binary,
		Some(FormatArg::Las) => ExportFormat::las(),
		None => ExportFormat::from_path(&args.output),
	};
	let format = match format {
		ExportFormat::Las { .. } => ExportFormat::Las {
			scale: DVec3::splat(scale),
		},
		other => other,
	};

	let bounds = match args.bounds.as_deref() {
		None => None,
		Some(&[min_x, min_y, min_z, max_x, max_y, max_z]) => {
			let (min, max) = (DVec3::new(min_x, min_y, min_z), DVec3::new(max_x, max_y, max_z));
			if !min.cmple(max).all() {
				bail!("box minimum {min} exceeds maximum {max}");
			}
			Some(DAabb3::new(min, max))
		}
		Some(values) => bail!("--box takes 6 values, got {}", values.len()),
	};

	let octree = ProcessOctree::open(&args.dataset, mib(args.memory_mb.unwrap_or(settings.memory_cache_mb)))?;
	export_dataset(&octree, &args.output, format, bounds.as_ref())?;
	Ok(())
}
