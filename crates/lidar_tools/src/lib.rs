//! Shared plumbing of the lidar_octree command line tools.
//!
//! - [`config`]: optional TOML settings file, overridden by command line flags
//! - [`input`]: point producers feeding a [`lidar_octree::PointAccumulator`]

pub mod config;
pub mod input;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr log subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging(verbose: bool) {
	let default = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();
}

/// Mebibytes to bytes.
pub fn mib(megabytes: usize) -> usize {
	megabytes.saturating_mul(1024 * 1024)
}
