//! Build an out-of-core octree dataset from point files.
//!
//! ```text
//! lidar_preprocess scan_a.xyz scan_b.bin old.oct -o merged.oct -t 8
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lidar_octree::{OctreeCreator, OffsetMode, PointAccumulator};
use lidar_tools::config::{FormatSetting, OffsetSetting, Settings};
use lidar_tools::input::{accumulate, InputFormat};
use lidar_tools::{init_logging, mib};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lidar_preprocess")]
#[command(about = "Builds an octree dataset from text, binary, or existing dataset inputs")]
struct Args {
	/// Input files (`.xyz`/`.txt` text, `.bin` binary exports) or dataset directories.
	#[arg(required = true)]
	inputs: Vec<PathBuf>,

	/// Output dataset directory.
	#[arg(short, long)]
	output: PathBuf,

	/// Settings TOML file; flags override its `[preprocessor]` values.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Maximum points per octree node.
	#[arg(short = 'n', long)]
	max_points: Option<u32>,

	/// Point buffer size in MiB.
	#[arg(short, long)]
	memory_mb: Option<usize>,

	/// Worker threads for the final build.
	#[arg(short, long)]
	threads: Option<usize>,

	/// Coordinate precision of the stored points.
	#[arg(long, value_enum)]
	point_format: Option<FormatSetting>,

	/// Coordinate offset: `auto`, `zero`, or `x,y,z`.
	#[arg(long)]
	offset: Option<OffsetSetting>,

	/// Directory for temporary node files.
	#[arg(long)]
	temp_dir: Option<PathBuf>,

	/// Log the extents of each input after reading it.
	#[arg(long)]
	print_extents: bool,

	#[arg(short, long)]
	verbose: bool,
}

fn main() -> Result<()> {
	let args = Args::parse();
	init_logging(args.verbose);

	let mut settings = Settings::load_or_default(args.config.as_deref())?.preprocessor;
	if let Some(max_points) = args.max_points {
		settings.max_points_per_node = max_points;
		settings.temp_max_points_per_node = None;
	}
	if let Some(memory_mb) = args.memory_mb {
		settings.memory_cache_mb = memory_mb;
	}
	if let Some(threads) = args.threads {
		settings.num_threads = threads;
	}
	if let Some(format) = args.point_format {
		settings.point_format = format;
	}
	if let Some(offset) = args.offset {
		settings.offset = offset;
	}
	if let Some(temp_dir) = args.temp_dir {
		settings.temp_dir = Some(temp_dir);
	}
	let config = settings.build_config()?;

	let mut accumulator = PointAccumulator::new(&config)?;
	accumulator.set_offset_mode(OffsetMode::from(settings.offset))?;
	for input in &args.inputs {
		let format = InputFormat::detect(input);
		accumulate(input, format, mib(settings.memory_cache_mb), &mut accumulator)?;
		if args.print_extents {
			info!("extents of {}", input.display());
			accumulator.print_extents();
			accumulator.reset_extents();
		}
	}
	info!(
		points = accumulator.num_points(),
		rejected = accumulator.num_rejected(),
		offset = %accumulator.point_offset(),
		"accumulated all inputs"
	);

	let summary = OctreeCreator::new(config)?
		.create(accumulator.finish()?, &args.output)
		.with_context(|| format!("building {}", args.output.display()))?;
	info!(
		nodes = summary.num_nodes,
		leaves = summary.num_leaves,
		depth = summary.depth,
		points = summary.num_points,
		"wrote {}",
		args.output.display()
	);
	Ok(())
}
