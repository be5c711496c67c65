//! Compute per-point normals of a dataset and store them next to it.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lidar_octree::{NormalCalculator, ProcessOctree};
use lidar_tools::config::Settings;
use lidar_tools::{init_logging, mib};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lidar_illuminate")]
#[command(about = "Estimates point normals by local plane fitting")]
struct Args {
	/// Dataset directory.
	dataset: PathBuf,

	/// Settings TOML file; flags override its `[illuminator]` values.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Neighbourhood radius.
	#[arg(short, long)]
	radius: Option<f64>,

	/// Use the K nearest points instead of every point within the radius.
	#[arg(short = 'k', long)]
	nearest: Option<usize>,

	/// Search bound for `--nearest`.
	#[arg(long)]
	max_radius: Option<f64>,

	/// Node cache size in MiB.
	#[arg(short, long)]
	memory_mb: Option<usize>,

	#[arg(short, long)]
	threads: Option<usize>,

	#[arg(short, long)]
	verbose: bool,
}

fn main() -> Result<()> {
	let args = Args::parse();
	init_logging(args.verbose);

	let mut settings = Settings::load_or_default(args.config.as_deref())?.illuminator;
	settings.radius = args.radius.or(settings.radius);
	settings.nearest = args.nearest.or(settings.nearest);
	settings.max_radius = args.max_radius.or(settings.max_radius);
	settings.memory_cache_mb = args.memory_mb.unwrap_or(settings.memory_cache_mb);
	settings.num_threads = args.threads.unwrap_or(settings.num_threads);
	let neighborhood = settings.neighborhood()?;

	let octree = ProcessOctree::open(&args.dataset, mib(settings.memory_cache_mb))?;
	let stats = NormalCalculator::new(&octree, neighborhood, settings.num_threads)?.compute()?;
	let traversal = octree.stats();
	info!(
		fitted = stats.fitted,
		degenerate = stats.degenerate,
		propagated = stats.propagated,
		nodes_loaded = traversal.nodes_loaded,
		cache_hits = traversal.cache_hits,
		"normals written for {}",
		args.dataset.display()
	);
	Ok(())
}
